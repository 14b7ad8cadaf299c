use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use libfsark::bundle::BundleManager;
use libfsark::config::Config;
use libfsark::image::ImageCache;
use libfsark::spec::Provenance;

use crate::config_path;

pub mod info;
pub mod list;
pub mod pull;
pub mod run;
pub mod spec_json;

fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, Config)> {
    let path = config_path::locate(explicit)?;
    let config = Config::load(&path)?;
    Ok((path, config))
}

fn provenance() -> Provenance {
    Provenance::detect(env!("CARGO_PKG_VERSION"), Some(env!("VERGEN_GIT_SHA")))
}

fn bundle_manager(config: &Config) -> Result<BundleManager> {
    let cache = ImageCache::from_env(&config.insecure_registries)
        .context("failed to set up the image cache")?;
    Ok(BundleManager::new(cache, provenance()))
}
