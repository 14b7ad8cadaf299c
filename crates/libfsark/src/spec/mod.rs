//! Builds the runtime specification for a rootless sandbox.
//!
//! The policy is fixed: the process runs as root inside a fresh user
//! namespace mapped onto the invoking user, holds only `CAP_AUDIT_WRITE` and
//! `CAP_KILL`, cannot gain privileges, and sees a read-only root filesystem.
//! Only the process arguments, environment, bind mounts and the host
//! networking switch vary between invocations.
mod mounts;

use std::io::Write;
use std::path::PathBuf;

use oci_spec::runtime::{
    Capabilities, Capability, LinuxBuilder, LinuxCapabilities, LinuxCapabilitiesBuilder,
    LinuxIdMappingBuilder, LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType,
    PosixRlimit, ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use serde_json::Value;

pub use mounts::{BindMount, RESOLV_CONF};

pub const OCI_VERSION: &str = "1.0.2-dev";
pub const HOSTNAME: &str = "fsark";
pub const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const NAMESPACES: [LinuxNamespaceType; 6] = [
    LinuxNamespaceType::Pid,
    LinuxNamespaceType::Ipc,
    LinuxNamespaceType::Uts,
    LinuxNamespaceType::Mount,
    LinuxNamespaceType::Cgroup,
    LinuxNamespaceType::User,
];

const MASKED_PATHS: [&str; 10] = [
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

const READONLY_PATHS: [&str; 5] = [
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("failed to build runtime spec")]
    Build(#[from] oci_spec::OciSpecError),
    #[error("bind mount destination {destination:?} is not absolute")]
    RelativeDestination { destination: PathBuf },
}

/// Identity of whoever started the sandbox and of the launcher build, passed
/// into the sandbox as `FSARK_*` variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub user: Option<String>,
    pub binary: Option<PathBuf>,
    pub version: Option<String>,
    pub commit: Option<String>,
}

impl Provenance {
    /// Collects the invoking user and executable from the running process.
    pub fn detect(version: &str, commit: Option<&str>) -> Self {
        Self {
            user: std::env::var("USER").ok().filter(|user| !user.is_empty()),
            binary: std::env::current_exe().ok(),
            version: Some(version.to_owned()),
            commit: commit.map(str::to_owned),
        }
    }

    fn env(&self) -> Vec<String> {
        let mut env = Vec::with_capacity(4);
        if let Some(user) = &self.user {
            env.push(format!("FSARK_USER={user}"));
        }
        if let Some(binary) = &self.binary {
            env.push(format!("FSARK_BINARY={}", binary.display()));
        }
        if let Some(version) = &self.version {
            env.push(format!("FSARK_VERSION={version}"));
        }
        if let Some(commit) = &self.commit {
            env.push(format!("FSARK_COMMIT={commit}"));
        }
        env
    }
}

/// Everything that varies between two sandboxes.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub args: Vec<String>,
    /// Appended after `PATH` and the provenance variables, in this order.
    pub env: Vec<(String, String)>,
    /// Working directory inside the sandbox.
    pub cwd: PathBuf,
    pub rootfs: PathBuf,
    pub mounts: Vec<BindMount>,
    /// Host user and group the sandbox root maps onto.
    pub uid: u32,
    pub gid: u32,
    pub host_networking: bool,
    pub provenance: Provenance,
}

fn capabilities() -> Result<LinuxCapabilities, SpecError> {
    let caps: Capabilities = [Capability::AuditWrite, Capability::Kill]
        .into_iter()
        .collect();
    let mut capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps.clone())
        .ambient(caps)
        .build()?;
    capabilities.set_inheritable(None);
    Ok(capabilities)
}

fn namespaces() -> Result<Vec<LinuxNamespace>, SpecError> {
    NAMESPACES
        .iter()
        .map(|typ| {
            LinuxNamespaceBuilder::default()
                .typ(*typ)
                .build()
                .map_err(SpecError::from)
        })
        .collect()
}

/// Builds the complete runtime spec for `request`. The result depends on
/// nothing but the request.
pub fn build(request: &SandboxRequest) -> Result<Spec, SpecError> {
    let mut env = vec![DEFAULT_PATH.to_owned()];
    env.extend(request.provenance.env());
    env.extend(
        request
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}")),
    );

    let process = ProcessBuilder::default()
        .terminal(true)
        .user(UserBuilder::default().uid(0_u32).gid(0_u32).build()?)
        .args(request.args.clone())
        .env(env)
        .cwd(&request.cwd)
        .capabilities(capabilities()?)
        .rlimits(Vec::<PosixRlimit>::new())
        .no_new_privileges(true)
        .build()?;

    let mut mounts = mounts::baseline()?;
    if request.host_networking {
        mounts.push(mounts::resolv_conf()?);
    }
    for mount in &request.mounts {
        mounts.push(mounts::user_bind(mount)?);
    }

    let mut linux = LinuxBuilder::default()
        .uid_mappings(vec![LinuxIdMappingBuilder::default()
            .host_id(request.uid)
            .container_id(0_u32)
            .size(1_u32)
            .build()?])
        .gid_mappings(vec![LinuxIdMappingBuilder::default()
            .host_id(request.gid)
            .container_id(0_u32)
            .size(1_u32)
            .build()?])
        .namespaces(namespaces()?)
        .masked_paths(MASKED_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .readonly_paths(READONLY_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .build()?;
    // no cgroup limits are requested, not even the default device rule
    linux.set_resources(None);

    let mut spec = SpecBuilder::default()
        .version(OCI_VERSION)
        .process(process)
        .root(
            RootBuilder::default()
                .path(&request.rootfs)
                .readonly(true)
                .build()?,
        )
        .hostname(HOSTNAME)
        .mounts(mounts)
        .linux(linux)
        .build()?;
    spec.set_annotations(None);

    Ok(spec)
}

/// Writes `spec` as pretty JSON. Capability sets are unordered in memory and
/// are emitted sorted, so equal specs always serialize to equal bytes.
pub fn to_writer_pretty<W: Write>(writer: W, spec: &Spec) -> serde_json::Result<()> {
    serde_json::to_writer_pretty(writer, &encode(spec)?)
}

fn encode(spec: &Spec) -> serde_json::Result<Value> {
    let mut value = serde_json::to_value(spec)?;
    if let Some(Value::Object(sets)) = value.pointer_mut("/process/capabilities") {
        for set in sets.values_mut() {
            if let Value::Array(capabilities) = set {
                capabilities.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            }
        }
    }
    Ok(value)
}
