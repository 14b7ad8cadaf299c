use crate::bundle::BundleError;
use crate::config::ConfigError;
use crate::image::ImageError;
use crate::launcher::LaunchError;
use crate::spec::SpecError;
use crate::unpack::UnpackError;

pub type Result<T> = std::result::Result<T, FsarkError>;

/// Any failure surfaced by the library. Each variant wraps the error of the
/// component that failed, which in turn names the path or reference involved.
#[derive(Debug, thiserror::Error)]
pub enum FsarkError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Unpack(#[from] UnpackError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}
