//! # libfsark
//! Building blocks of a rootless container launcher: resolve an image into a
//! cached root filesystem archive, unpack it into an OCI bundle next to a
//! generated runtime spec, and hand that bundle to a low-level runtime such as
//! `runc`.
pub mod bundle;
pub mod config;
pub mod digest;
pub mod error;
pub mod image;
pub mod launcher;
pub mod spec;
pub mod unpack;

pub use error::{FsarkError, Result};
pub use oci_spec;
