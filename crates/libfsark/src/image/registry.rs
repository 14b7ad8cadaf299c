use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde::Deserialize;

use super::layers::{self, Layer};
use super::ImageError;

/// Layer encodings requested from registries. Anything else is refused at
/// pull time.
const LAYER_MEDIA_TYPES: &[&str] = &[
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// Source of images that are not already local files.
pub trait Registry {
    /// Manifest digest of `reference`, as reported by the registry.
    fn digest(&self, reference: &Reference) -> Result<String, ImageError>;
    /// Writes the flattened root filesystem of `reference` as a tar stream.
    fn save(&self, reference: &Reference, dest: &mut dyn Write) -> Result<(), ImageError>;
}

/// Registry client backed by `oci-distribution`. Requests run to completion
/// on a private single-threaded runtime.
pub struct OciRegistry {
    client: Client,
    runtime: tokio::runtime::Runtime,
    credentials: DockerCredentials,
}

impl OciRegistry {
    /// `insecure_registries` are reached over plain HTTP.
    pub fn new(
        insecure_registries: &[String],
        credentials: DockerCredentials,
    ) -> Result<Self, ImageError> {
        let protocol = if insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure_registries.to_vec())
        };
        let client = Client::new(ClientConfig {
            protocol,
            ..Default::default()
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ImageError::Runtime)?;

        Ok(Self {
            client,
            runtime,
            credentials,
        })
    }

    fn fetch_error(reference: &Reference, err: impl std::fmt::Display) -> ImageError {
        ImageError::Fetch {
            reference: reference.whole(),
            reason: err.to_string(),
        }
    }
}

impl Registry for OciRegistry {
    fn digest(&self, reference: &Reference) -> Result<String, ImageError> {
        let auth = self.credentials.auth_for(reference.registry());
        let digest = self
            .runtime
            .block_on(self.client.fetch_manifest_digest(reference, &auth))
            .map_err(|err| Self::fetch_error(reference, err))?;
        tracing::debug!(reference = %reference, %digest, "resolved manifest digest");
        Ok(digest)
    }

    fn save(&self, reference: &Reference, dest: &mut dyn Write) -> Result<(), ImageError> {
        let auth = self.credentials.auth_for(reference.registry());
        let image = self
            .runtime
            .block_on(
                self.client
                    .pull(reference, &auth, LAYER_MEDIA_TYPES.to_vec()),
            )
            .map_err(|err| Self::fetch_error(reference, err))?;
        tracing::debug!(reference = %reference, layers = image.layers.len(), "pulled image layers");

        let layers: Vec<Layer> = image
            .layers
            .into_iter()
            .map(|layer| Layer::new(layer.media_type, layer.data))
            .collect();
        layers::flatten(&layers, dest)
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Registry credentials taken from a docker client configuration file.
/// Only inline `auths` entries are understood; credential helpers are not.
#[derive(Debug, Default, Clone)]
pub struct DockerCredentials {
    entries: HashMap<String, (String, String)>,
}

impl DockerCredentials {
    /// Reads `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
    /// A missing or unreadable file yields no credentials.
    pub fn from_env() -> Self {
        let path = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir).join("config.json"),
            None => match std::env::var_os("HOME") {
                Some(home) => Path::new(&home).join(".docker").join("config.json"),
                None => return Self::default(),
            },
        };
        match Self::load(&path) {
            Ok(credentials) => credentials,
            Err(err) => {
                tracing::debug!(?path, ?err, "no registry credentials loaded");
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    fn parse(content: &str) -> Self {
        let file: DockerConfigFile = match serde_json::from_str(content) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(?err, "ignoring malformed docker configuration");
                return Self::default();
            }
        };

        let entries = file
            .auths
            .into_iter()
            .filter_map(|(server, entry)| {
                let pair = match (entry.username, entry.password, entry.auth) {
                    (Some(user), Some(password), _) => Some((user, password)),
                    (_, _, Some(auth)) => decode_auth(&auth),
                    _ => None,
                };
                pair.map(|pair| (normalize_server(&server), pair))
            })
            .collect();
        Self { entries }
    }

    /// Basic auth for `registry` when an entry matches, anonymous otherwise.
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        let key = normalize_server(registry);
        match self.entries.get(&key) {
            Some((user, password)) => RegistryAuth::Basic(user.clone(), password.clone()),
            None => RegistryAuth::Anonymous,
        }
    }
}

fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_owned(), password.to_owned()))
}

/// Reduces a docker config server key to a bare host name, folding the
/// Docker Hub aliases together.
fn normalize_server(server: &str) -> String {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            "docker.io".to_owned()
        }
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(auth: RegistryAuth) -> Option<(String, String)> {
        match auth {
            RegistryAuth::Basic(user, password) => Some((user, password)),
            _ => None,
        }
    }

    #[test]
    fn test_credentials_from_encoded_auth() {
        // "ark:s3cret"
        let credentials = DockerCredentials::parse(
            r#"{"auths": {"registry.example.com": {"auth": "YXJrOnMzY3JldA=="}}}"#,
        );

        assert_eq!(
            basic(credentials.auth_for("registry.example.com")),
            Some(("ark".to_owned(), "s3cret".to_owned()))
        );
        assert!(basic(credentials.auth_for("other.example.com")).is_none());
    }

    #[test]
    fn test_credentials_docker_hub_alias() {
        let credentials = DockerCredentials::parse(
            r#"{"auths": {"https://index.docker.io/v1/": {"username": "ark", "password": "pw"}}}"#,
        );

        assert_eq!(
            basic(credentials.auth_for("docker.io")),
            Some(("ark".to_owned(), "pw".to_owned()))
        );
    }

    #[test]
    fn test_credentials_skip_undecodable_entries() {
        let credentials = DockerCredentials::parse(
            r#"{"auths": {"a.example.com": {"auth": "!!!"}, "b.example.com": {}}}"#,
        );

        assert!(basic(credentials.auth_for("a.example.com")).is_none());
        assert!(basic(credentials.auth_for("b.example.com")).is_none());
    }

    #[test]
    fn test_credentials_malformed_file() {
        let credentials = DockerCredentials::parse("{ not json");
        assert!(basic(credentials.auth_for("docker.io")).is_none());
    }

    #[test]
    fn test_credentials_load_missing_file() {
        assert!(DockerCredentials::load(Path::new("/nonexistent/fsark/config.json")).is_err());
    }

    #[test]
    fn test_normalize_server() {
        assert_eq!(normalize_server("https://index.docker.io/v1/"), "docker.io");
        assert_eq!(normalize_server("http://localhost:5000"), "localhost:5000");
        assert_eq!(normalize_server("quay.io"), "quay.io");
    }
}
