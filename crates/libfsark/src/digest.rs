//! Normalization of the textual forms a content digest shows up in.

const SHA256_PREFIX: &str = "sha256:";
const MANIFEST_SUFFIX: &str = ".json";

/// Turns `sha256:<hex>`, `<hex>.json` or a bare `<hex>` into the bare hex
/// string used to name cache files. Only one rule applies; the surviving string
/// is not checked for being valid hex.
pub fn canonicalize(raw: &str) -> &str {
    if let Some(hex) = raw.strip_prefix(SHA256_PREFIX) {
        hex
    } else if let Some(hex) = raw.strip_suffix(MANIFEST_SUFFIX) {
        hex
    } else {
        raw
    }
}
