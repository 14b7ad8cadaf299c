use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use libfsark::bundle::{BundleManager, ROOTFS_DIR};
use libfsark::config::Config;
use libfsark::image::Registry;
use libfsark::oci_spec::runtime::Spec;

/// Print the runtime spec a command would run with, without running it
#[derive(Parser, Debug)]
pub struct SpecCmd {
    /// Name of the command in the configuration
    pub command: String,
    /// Arguments appended to the command line
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// The runtime spec `name` gets when launched from `cwd`. Nothing is fetched, the
/// root filesystem is the bundle-relative `rootfs` directory.
fn generate<R: Registry>(
    manager: &BundleManager<R>,
    config: &Config,
    name: &str,
    args: &[String],
    cwd: &Path,
) -> Result<Spec> {
    let invocation = config.invocation(name, args)?;
    let request = manager.sandbox_request(&invocation, cwd, Path::new(ROOTFS_DIR));
    libfsark::spec::build(&request).with_context(|| format!("failed to build the runtime spec for {name:?}"))
}

pub fn spec(args: SpecCmd, config: Option<&Path>) -> Result<()> {
    let (_, config) = super::load_config(config)?;
    let manager = super::bundle_manager(&config)?;
    let cwd = std::env::current_dir().context("failed to get the current directory")?;
    let spec = generate(&manager, &config, &args.command, &args.args, &cwd)?;

    let mut writer = BufWriter::new(io::stdout().lock());
    libfsark::spec::to_writer_pretty(&mut writer, &spec)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use libfsark::image::{DockerCredentials, ImageCache, OciRegistry};
    use libfsark::spec::Provenance;

    use super::*;

    #[test]
    fn test_generate_does_not_touch_the_cache() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let cache_root = tmp.path().join("cache");
        let registry = OciRegistry::new(&[], DockerCredentials::default())?;
        let manager = BundleManager::new(ImageCache::new(&cache_root, registry), Provenance::default());
        let config = Config::parse(
            r#"{
                "images": {"alpine": {"rootfs": "docker.io/library/alpine:3.19"}},
                "commands": {"sh": {"image": "alpine", "command": "/bin/sh", "command_start": ["-e"]}}
            }"#,
        )?;

        let spec = generate(&manager, &config, "sh", &["-c".to_owned(), "true".to_owned()], tmp.path())?;

        let process = spec.process().as_ref().context("no process")?;
        assert_eq!(process.args().as_ref().context("no args")?, &vec!["/bin/sh", "-e", "-c", "true"]);
        assert_eq!(spec.root().as_ref().context("no root")?.path(), Path::new("rootfs"));
        assert!(!cache_root.exists());
        Ok(())
    }

    #[test]
    fn test_generate_unknown_command() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let registry = OciRegistry::new(&[], DockerCredentials::default())?;
        let manager = BundleManager::new(ImageCache::new(tmp.path(), registry), Provenance::default());
        let config = Config::parse(r#"{"commands": {}}"#)?;

        let err = generate(&manager, &config, "missing", &[], tmp.path()).unwrap_err();

        assert!(err.to_string().contains("missing"));
        Ok(())
    }
}
