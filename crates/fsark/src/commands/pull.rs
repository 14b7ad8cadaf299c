use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use libfsark::config::{Config, ConfigError};
use libfsark::image::ImageCache;

use crate::config_path;

/// Fetch an image into the cache and print the archive path
#[derive(Parser, Debug)]
pub struct Pull {
    /// Image name or tag from the configuration, or a registry reference
    pub image: String,
}

/// Configuration is optional here: without it, `image` is taken as a raw
/// reference and only the default registry settings apply.
fn optional_config(explicit: Option<&Path>) -> Result<Option<Config>> {
    match config_path::locate(explicit) {
        Ok(path) => Ok(Some(Config::load(path)?)),
        Err(ConfigError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn reference(config: Option<&Config>, image: &str) -> String {
    config
        .and_then(|config| config.image(image).ok())
        .map(|found| found.rootfs.clone())
        .unwrap_or_else(|| image.to_owned())
}

pub fn pull(args: Pull, config: Option<&Path>) -> Result<()> {
    let config = optional_config(config)?;
    let reference = reference(config.as_ref(), &args.image);
    let insecure = config
        .as_ref()
        .map(|config| config.insecure_registries.clone())
        .unwrap_or_default();

    let cache = ImageCache::from_env(&insecure).context("failed to set up the image cache")?;
    let archive = cache
        .resolve(&reference)
        .with_context(|| format!("failed to pull {reference}"))?;
    println!("{}", archive.display());
    Ok(())
}
