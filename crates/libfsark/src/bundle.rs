//! Materializes the on-disk bundle (`config.json` plus `rootfs/`) for one
//! invocation of a configured command.
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::image::{ImageCache, ImageError, OciRegistry, Registry};
use crate::spec::{self, BindMount, Provenance, SandboxRequest, SpecError};
use crate::unpack::{self, UnpackError};

pub const BUNDLE_PREFIX: &str = "container-";
pub const CONFIG_FILE: &str = "config.json";
pub const ROOTFS_DIR: &str = "rootfs";
/// Where the caller's working directory appears inside the sandbox.
pub const WORKDIR: &str = "/ark";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to create bundle directory in {parent:?}")]
    TempDir { parent: PathBuf, source: io::Error },
    #[error("failed to resolve image {image:?}")]
    Resolve {
        image: String,
        #[source]
        source: ImageError,
    },
    #[error("failed to build runtime spec")]
    Spec(#[from] SpecError),
    #[error("failed to write runtime spec {path:?}")]
    WriteSpec { path: PathBuf, source: io::Error },
    #[error("failed to encode runtime spec {path:?}")]
    EncodeSpec {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to create rootfs directory {path:?}")]
    CreateRootfs { path: PathBuf, source: io::Error },
    #[error("failed to unpack {archive:?} into the bundle")]
    Extract {
        archive: PathBuf,
        #[source]
        source: UnpackError,
    },
}

/// A command resolved from configuration, ready to be turned into a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Local tar path or registry reference of the root filesystem.
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Extra binds on top of the working directory.
    pub mounts: Vec<BindMount>,
    pub host_networking: bool,
}

/// A bundle directory owned by one invocation. Dropping it removes the
/// directory, including read-only directories unpacked from the image.
#[derive(Debug)]
pub struct Bundle {
    dir: Option<TempDir>,
    path: PathBuf,
    id: String,
}

impl Bundle {
    fn new(dir: TempDir) -> Self {
        let path = dir.path().to_path_buf();
        let id = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            dir: Some(dir),
            path,
            id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Container id handed to the runtime: the generated directory name.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rootfs(&self) -> PathBuf {
        self.path.join(ROOTFS_DIR)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        make_removable(dir.path());
        if let Err(err) = dir.close() {
            tracing::warn!(path = ?self.path, ?err, "failed to remove bundle directory");
        } else {
            tracing::debug!(path = ?self.path, "removed bundle directory");
        }
    }
}

/// Grants the owner full access to every directory under `path`, so that
/// read-only directories from the image can be emptied.
fn make_removable(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if !metadata.is_dir() {
        return;
    }
    let mode = metadata.permissions().mode();
    if mode & 0o700 != 0o700 {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700));
    }
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            make_removable(&entry.path());
        }
    }
}

pub struct BundleManager<R: Registry = OciRegistry> {
    cache: ImageCache<R>,
    provenance: Provenance,
    uid: u32,
    gid: u32,
    parent: PathBuf,
}

impl<R: Registry> BundleManager<R> {
    /// Bundles are created in the system temporary directory and map the
    /// sandbox root onto the effective user and group of this process.
    pub fn new(cache: ImageCache<R>, provenance: Provenance) -> Self {
        Self {
            cache,
            provenance,
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            parent: std::env::temp_dir(),
        }
    }

    pub fn with_parent<P: Into<PathBuf>>(mut self, parent: P) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn cache(&self) -> &ImageCache<R> {
        &self.cache
    }

    /// The runtime spec inputs for `invocation`: `cwd` is bound to [`WORKDIR`] ahead
    /// of the configured mounts.
    pub fn sandbox_request(&self, invocation: &Invocation, cwd: &Path, rootfs: &Path) -> SandboxRequest {
        let mut mounts = Vec::with_capacity(invocation.mounts.len() + 1);
        mounts.push(BindMount::new(cwd, WORKDIR));
        mounts.extend(invocation.mounts.iter().cloned());

        SandboxRequest {
            args: invocation.args.clone(),
            env: invocation.env.clone(),
            cwd: PathBuf::from(WORKDIR),
            rootfs: rootfs.to_path_buf(),
            mounts,
            uid: self.uid,
            gid: self.gid,
            host_networking: invocation.host_networking,
            provenance: self.provenance.clone(),
        }
    }

    /// Builds a complete bundle for `invocation`. On error nothing is left
    /// on disk.
    pub fn materialize(&self, invocation: &Invocation, cwd: &Path) -> Result<Bundle, BundleError> {
        let dir = tempfile::Builder::new()
            .prefix(BUNDLE_PREFIX)
            .tempdir_in(&self.parent)
            .map_err(|err| BundleError::TempDir {
                parent: self.parent.clone(),
                source: err,
            })?;
        let bundle = Bundle::new(dir);
        tracing::debug!(path = ?bundle.path(), image = %invocation.image, "materializing bundle");

        let archive = self
            .cache
            .resolve(&invocation.image)
            .map_err(|err| BundleError::Resolve {
                image: invocation.image.clone(),
                source: err,
            })?;

        let rootfs = bundle.rootfs();
        let spec = spec::build(&self.sandbox_request(invocation, cwd, &rootfs))?;
        write_spec(&spec, &bundle.config_path())?;

        fs::create_dir_all(&rootfs).map_err(|err| BundleError::CreateRootfs {
            path: rootfs.clone(),
            source: err,
        })?;
        unpack::extract(&archive, &rootfs).map_err(|err| BundleError::Extract {
            archive: archive.clone(),
            source: err,
        })?;

        tracing::info!(path = ?bundle.path(), id = bundle.id(), "bundle ready");
        Ok(bundle)
    }
}

fn write_spec(runtime_spec: &oci_spec::runtime::Spec, path: &Path) -> Result<(), BundleError> {
    let write_error = |err: io::Error| BundleError::WriteSpec {
        path: path.to_path_buf(),
        source: err,
    };
    let file = File::create(path).map_err(write_error)?;
    let mut writer = BufWriter::new(file);
    spec::to_writer_pretty(&mut writer, runtime_spec).map_err(|err| BundleError::EncodeSpec {
        path: path.to_path_buf(),
        source: err,
    })?;
    writer.flush().map_err(write_error)
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Context, Result};
    use oci_spec::runtime::Spec;
    use tar::{Builder, EntryType, Header};

    use super::*;
    use crate::image::Reference;

    struct NoRegistry;

    impl Registry for NoRegistry {
        fn digest(&self, reference: &Reference) -> Result<String, ImageError> {
            Err(ImageError::Fetch {
                reference: reference.whole(),
                reason: "offline".to_owned(),
            })
        }

        fn save(&self, reference: &Reference, _: &mut dyn io::Write) -> Result<(), ImageError> {
            self.digest(reference).map(|_| ())
        }
    }

    fn rootfs_archive(dir: &Path) -> Result<PathBuf> {
        let path = dir.join("image.tar");
        let mut builder = Builder::new(File::create(&path)?);

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o555);
        header.set_size(0);
        builder.append_data(&mut header, "bin", io::empty())?;

        let content = b"#!/bin/sh\n";
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o755);
        header.set_size(content.len() as u64);
        builder.append_data(&mut header, "bin/true", &content[..])?;

        builder.into_inner()?.flush()?;
        Ok(path)
    }

    fn manager(tmp: &Path) -> BundleManager<NoRegistry> {
        let cache = ImageCache::new(tmp.join("cache"), NoRegistry);
        BundleManager::new(cache, Provenance::default()).with_parent(tmp)
    }

    fn invocation(image: &Path) -> Invocation {
        Invocation {
            image: image.to_string_lossy().into_owned(),
            args: vec!["/bin/true".to_owned()],
            env: vec![("TERM".to_owned(), "dumb".to_owned())],
            mounts: vec![BindMount::same_path("/opt/data")],
            host_networking: false,
        }
    }

    #[test]
    fn test_materialize_layout() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = rootfs_archive(tmp.path())?;
        let manager = manager(tmp.path());

        let bundle = manager.materialize(&invocation(&archive), Path::new("/home/ark/work"))?;

        assert!(bundle.id().starts_with(BUNDLE_PREFIX));
        assert_eq!(bundle.path().parent(), Some(tmp.path()));
        assert_eq!(fs::read(bundle.rootfs().join("bin/true"))?, b"#!/bin/sh\n");

        let spec: Spec = serde_json::from_reader(File::open(bundle.config_path())?)?;
        let process = spec.process().as_ref().context("no process")?;
        assert_eq!(process.args().as_ref().context("no args")?, &vec!["/bin/true"]);
        assert_eq!(process.cwd(), Path::new(WORKDIR));
        assert_eq!(
            spec.root().as_ref().context("no root")?.path(),
            &bundle.rootfs()
        );

        let mounts = spec.mounts().as_ref().context("no mounts")?;
        let binds: Vec<(&Path, Option<&Path>)> = mounts
            .iter()
            .skip(8)
            .map(|m| (m.destination().as_path(), m.source().as_deref()))
            .collect();
        assert_eq!(
            binds,
            vec![
                (Path::new(WORKDIR), Some(Path::new("/home/ark/work"))),
                (Path::new("/opt/data"), Some(Path::new("/opt/data"))),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_bundle_removed_on_drop() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = rootfs_archive(tmp.path())?;
        let manager = manager(tmp.path());

        let bundle = manager.materialize(&invocation(&archive), Path::new("/"))?;
        let path = bundle.path().to_path_buf();
        // read-only directory from the image must not block removal
        assert_eq!(
            fs::metadata(bundle.rootfs().join("bin"))?.permissions().mode() & 0o777,
            0o555
        );
        drop(bundle);

        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_materialize_failure_leaves_nothing() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let manager = manager(tmp.path());
        let invocation = Invocation {
            image: "registry.example.com/missing:1".to_owned(),
            ..Default::default()
        };

        match manager.materialize(&invocation, Path::new("/")) {
            Err(BundleError::Resolve { image, .. }) => {
                assert_eq!(image, "registry.example.com/missing:1")
            }
            other => bail!("expected Resolve error, got {:?}", other),
        }
        let leftovers = fs::read_dir(tmp.path())?
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(BUNDLE_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn test_materialize_corrupt_image() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("broken.tar");
        fs::write(&archive, vec![0x42; 1024])?;
        let manager = manager(tmp.path());

        assert!(matches!(
            manager.materialize(&invocation(&archive), Path::new("/")),
            Err(BundleError::Extract { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_sandbox_request_binds_cwd_first() {
        let tmp = Path::new("/tmp");
        let manager = manager(tmp);
        let request = manager.sandbox_request(
            &invocation(Path::new("/img.tar")),
            Path::new("/home/ark"),
            Path::new("/bundle/rootfs"),
        );

        assert_eq!(request.cwd, PathBuf::from(WORKDIR));
        assert_eq!(request.mounts[0], BindMount::new("/home/ark", WORKDIR));
        assert_eq!(request.mounts[1], BindMount::same_path("/opt/data"));
        assert_eq!(request.uid, nix::unistd::geteuid().as_raw());
        assert_eq!(request.env, vec![("TERM".to_owned(), "dumb".to_owned())]);
    }
}
