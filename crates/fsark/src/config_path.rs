//! Locates the configuration file.
use std::path::{Path, PathBuf};

use libfsark::config::ConfigError;

pub const CONFIG_ENV: &str = "FSARK_CONFIG";
const CONFIG_FILE: &str = "fsark/config.json";
const SYSTEM_CONFIG: &str = "/etc/fsark/config.json";

/// Places searched when neither `--config` nor `$FSARK_CONFIG` is given, in
/// order of preference.
fn search_path() -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(3);
    // see https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|dir| !dir.is_empty()) {
        candidates.push(Path::new(&dir).join(CONFIG_FILE));
    }
    if let Some(home) = std::env::var_os("HOME").filter(|home| !home.is_empty()) {
        candidates.push(Path::new(&home).join(".config").join(CONFIG_FILE));
    }
    candidates.push(PathBuf::from(SYSTEM_CONFIG));
    candidates
}

/// An explicit path is returned even if it does not exist, so that loading
/// it reports the real problem.
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|path| !path.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    let searched = search_path();
    match searched.iter().find(|path| path.is_file()) {
        Some(path) => Ok(path.clone()),
        None => Err(ConfigError::NotFound { searched }),
    }
}
