use std::path::{Path, PathBuf};

use oci_spec::runtime::{Mount, MountBuilder};

use super::SpecError;

pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// A host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl BindMount {
    pub fn new<S: Into<PathBuf>, D: Into<PathBuf>>(source: S, destination: D) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Bind of `path` onto the same path inside the sandbox.
    pub fn same_path<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self::new(path.clone(), path)
    }
}

fn options(options: &[&str]) -> Vec<String> {
    options.iter().map(|o| o.to_string()).collect()
}

fn kernel_mount(
    destination: &str,
    typ: &str,
    source: &str,
    opts: &[&str],
) -> Result<Mount, SpecError> {
    let mut builder = MountBuilder::default()
        .destination(destination)
        .typ(typ)
        .source(source);
    if !opts.is_empty() {
        builder = builder.options(options(opts));
    }
    Ok(builder.build()?)
}

fn bind(source: &Path, destination: &Path, opts: &[&str]) -> Result<Mount, SpecError> {
    Ok(MountBuilder::default()
        .destination(destination)
        .typ("none")
        .source(source)
        .options(options(opts))
        .build()?)
}

/// The fixed mounts every sandbox gets, in the order they are applied.
pub fn baseline() -> Result<Vec<Mount>, SpecError> {
    Ok(vec![
        kernel_mount("/proc", "proc", "proc", &[])?,
        kernel_mount(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
        kernel_mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        )?,
        kernel_mount(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        kernel_mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        bind(
            Path::new("/sys"),
            Path::new("/sys"),
            &["rbind", "nosuid", "noexec", "nodev", "ro"],
        )?,
        kernel_mount("/tmp", "tmpfs", "tmpfs", &["nosuid", "noexec", "nodev"])?,
        kernel_mount(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        )?,
    ])
}

/// Read-only view of the host resolver configuration.
pub fn resolv_conf() -> Result<Mount, SpecError> {
    let path = Path::new(RESOLV_CONF);
    bind(path, path, &["bind", "nosuid", "noexec", "nodev", "ro"])
}

pub fn user_bind(mount: &BindMount) -> Result<Mount, SpecError> {
    if !mount.destination.is_absolute() {
        return Err(SpecError::RelativeDestination {
            destination: mount.destination.clone(),
        });
    }
    bind(
        &mount.source,
        &mount.destination,
        &["bind", "nosuid", "noexec", "nodev"],
    )
}
