//! Turns an image reference into a local root filesystem archive.
//!
//! A reference naming an existing local file is used as is. Anything else is
//! treated as a registry reference: its manifest digest names the cache entry
//! `<cache root>/<hex digest>.tar`, which is fetched and flattened only when it
//! does not exist yet. Cache entries are written to a temporary file and
//! renamed into place, so readers never see a partially written archive.
mod layers;
mod registry;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub use layers::{flatten, Layer};
pub use oci_distribution::Reference;
pub use registry::{DockerCredentials, OciRegistry, Registry};

use crate::digest;

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "SHARK_CONTAINER_CACHE";
/// Cache root relative to the home directory when no override is set.
pub const DEFAULT_CACHE_DIR: &str = ".shark";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("problem accessing image {path:?}")]
    Access { path: PathBuf, source: io::Error },
    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("failed to fetch {reference}: {reason}")]
    Fetch { reference: String, reason: String },
    #[error("registry returned unusable digest {digest:?} for {reference}")]
    InvalidDigest { reference: String, digest: String },
    #[error("neither ${} nor $HOME is set, cannot locate the image cache", CACHE_DIR_ENV)]
    NoCacheRoot,
    #[error("could not create container cache {path:?}")]
    CacheDir { path: PathBuf, source: io::Error },
    #[error("failed to write cache entry {path:?}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read layer {index} of the image")]
    Layer { index: usize, source: io::Error },
    #[error("failed to start the registry client")]
    Runtime(#[source] io::Error),
}

/// Returns the cache root: `$SHARK_CONTAINER_CACHE` if set, `$HOME/.shark`
/// otherwise. The directory is not created here.
pub fn default_cache_root() -> Result<PathBuf, ImageError> {
    if let Some(path) = std::env::var_os(CACHE_DIR_ENV) {
        return Ok(PathBuf::from(path));
    }
    std::env::var_os("HOME")
        .map(|home| Path::new(&home).join(DEFAULT_CACHE_DIR))
        .ok_or(ImageError::NoCacheRoot)
}

/// Content-addressed store of flattened image archives.
pub struct ImageCache<R: Registry = OciRegistry> {
    root: PathBuf,
    registry: R,
}

impl ImageCache<OciRegistry> {
    /// Cache rooted at [`default_cache_root`], talking to real registries.
    pub fn from_env(insecure_registries: &[String]) -> Result<Self, ImageError> {
        let root = default_cache_root()?;
        let registry = OciRegistry::new(insecure_registries, DockerCredentials::from_env())?;
        Ok(Self::new(root, registry))
    }
}

impl<R: Registry> ImageCache<R> {
    pub fn new<P: Into<PathBuf>>(root: P, registry: R) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Returns the path of a tar archive holding the root filesystem of
    /// `image_ref`, fetching it into the cache first if needed.
    pub fn resolve(&self, image_ref: &str) -> Result<PathBuf, ImageError> {
        let local = Path::new(image_ref);
        match fs::metadata(local) {
            Ok(_) => {
                tracing::debug!(path = ?local, "using local image archive");
                return Ok(local.to_path_buf());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ImageError::Access {
                    path: local.to_path_buf(),
                    source: err,
                })
            }
        }

        fs::create_dir_all(&self.root).map_err(|err| ImageError::CacheDir {
            path: self.root.clone(),
            source: err,
        })?;

        let reference: Reference =
            image_ref
                .parse()
                .map_err(|err| ImageError::InvalidReference {
                    reference: image_ref.to_owned(),
                    reason: format!("{err}"),
                })?;

        let raw_digest = self.registry.digest(&reference)?;
        let hex = digest::canonicalize(&raw_digest);
        if hex.is_empty() || hex.contains('/') {
            return Err(ImageError::InvalidDigest {
                reference: reference.whole(),
                digest: raw_digest.clone(),
            });
        }

        let path = self.root.join(format!("{hex}.tar"));
        if path.exists() {
            tracing::debug!(?path, reference = %reference, "image already cached");
            return Ok(path);
        }

        tracing::info!(?path, reference = %reference, "fetching image into cache");
        self.store(&reference, &path)?;
        Ok(path)
    }

    fn store(&self, reference: &Reference, path: &Path) -> Result<(), ImageError> {
        let write_error = |err: io::Error| ImageError::Write {
            path: path.to_path_buf(),
            source: err,
        };

        // dropped (and removed) on any early return
        let mut staging = tempfile::Builder::new()
            .prefix(".fetch-")
            .suffix(".tar")
            .tempfile_in(&self.root)
            .map_err(write_error)?;
        self.registry.save(reference, staging.as_file_mut())?;
        staging.as_file_mut().flush().map_err(write_error)?;
        staging.as_file().sync_all().map_err(write_error)?;
        staging
            .persist(path)
            .map_err(|err| write_error(err.error))?;
        Ok(())
    }
}
