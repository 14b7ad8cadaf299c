//! The JSON configuration naming images and the commands that run in them.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bundle::Invocation;
use crate::spec::BindMount;

pub const DEFAULT_RUNTIME: &str = "runc";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("unknown command {name:?}, valid commands are: {valid}")]
    UnknownCommand { name: String, valid: String },
    #[error("unknown image {name:?}, valid images are: {valid}")]
    UnknownImage { name: String, valid: String },
    #[error("no config file found, searched {searched:?}")]
    NotFound { searched: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub images: BTreeMap<String, Image>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandProfile>,
    /// Name or path of the low-level runtime.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Registries reached over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Local tar path or registry reference.
    pub rootfs: String,
    /// Alternative names the image can be looked up by.
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProfile {
    /// Key into `images`.
    pub image: String,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub command: String,
    #[serde(default)]
    pub command_start: Vec<String>,
    #[serde(default)]
    pub networking: Networking,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Networking {
    #[default]
    Isolated,
    Host,
}

impl TryFrom<String> for Networking {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "" | "none" | "isolated" => Ok(Networking::Isolated),
            "host" => Ok(Networking::Host),
            other => Err(format!(
                "unknown networking mode {other:?}, expected \"host\" or \"none\""
            )),
        }
    }
}

impl From<Networking> for String {
    fn from(value: Networking) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Networking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Networking::Isolated => write!(f, "none"),
            Networking::Host => write!(f, "host"),
        }
    }
}

impl CommandProfile {
    /// `[command] ++ command_start ++ extra`.
    pub fn argv(&self, extra: &[String]) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.command_start.iter().cloned())
            .chain(extra.iter().cloned())
            .collect()
    }

    pub fn bind_mounts(&self) -> Vec<BindMount> {
        self.mounts.iter().map(BindMount::same_path).collect()
    }
}

fn listing<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let mut names: Vec<&str> = names.map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    names.join(", ")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            source: err,
        })?;
        let config = Self::parse(&content).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            source: err,
        })?;
        tracing::debug!(
            ?path,
            commands = config.commands.len(),
            images = config.images.len(),
            "loaded config"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn command(&self, name: &str) -> Result<&CommandProfile, ConfigError> {
        self.commands
            .get(name)
            .ok_or_else(|| ConfigError::UnknownCommand {
                name: name.to_owned(),
                valid: listing(self.commands.keys()),
            })
    }

    /// Looks an image up by name, then by tag.
    pub fn image(&self, name: &str) -> Result<&Image, ConfigError> {
        if let Some(image) = self.images.get(name) {
            return Ok(image);
        }
        self.images
            .values()
            .find(|image| image.tags.iter().any(|tag| tag == name))
            .ok_or_else(|| ConfigError::UnknownImage {
                name: name.to_owned(),
                valid: listing(
                    self.images
                        .iter()
                        .flat_map(|(name, image)| std::iter::once(name).chain(&image.tags)),
                ),
            })
    }

    /// Resolves command `name` into everything needed to build its bundle.
    pub fn invocation(&self, name: &str, extra_args: &[String]) -> Result<Invocation, ConfigError> {
        let profile = self.command(name)?;
        let image = self.image(&profile.image)?;
        Ok(Invocation {
            image: image.rootfs.clone(),
            args: profile.argv(extra_args),
            env: profile
                .environment
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            mounts: profile.bind_mounts(),
            host_networking: profile.networking == Networking::Host,
        })
    }
}
