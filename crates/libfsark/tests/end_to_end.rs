use std::fs::{self, File, Permissions};
use std::io::{self, Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use libfsark::bundle::BundleManager;
use libfsark::config::Config;
use libfsark::image::{DockerCredentials, ImageCache, OciRegistry};
use libfsark::launcher::Launcher;
use libfsark::spec::Provenance;
use oci_spec::runtime::Spec;
use serial_test::serial;
use tar::{Builder, EntryType, Header};

fn single_file_rootfs(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("rootfs.tar");
    let mut builder = Builder::new(File::create(&path)?);
    let content = b"#!/bin/sh\nexit 0\n";
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o755);
    header.set_size(content.len() as u64);
    builder.append_data(&mut header, "bin/true", &content[..])?;
    builder.into_inner()?.flush()?;
    Ok(path)
}

/// A runtime that only checks the bundle it was handed is complete and
/// copies its spec next to itself.
fn stub_runtime(dir: &Path, exit_code: i32) -> Result<PathBuf> {
    let path = dir.join("stub-runc");
    let script = format!(
        "#!/bin/sh\n\
         [ \"$1\" = run ] && [ \"$2\" = --bundle ] || exit 64\n\
         [ -f \"$3/config.json\" ] && [ -f \"$3/rootfs/bin/true\" ] || exit 65\n\
         [ \"$(basename \"$3\")\" = \"$4\" ] || exit 66\n\
         cp \"$3/config.json\" \"{}\"\n\
         exit {exit_code}\n",
        dir.join("seen-config.json").display()
    );
    fs::write(&path, script)?;
    fs::set_permissions(&path, Permissions::from_mode(0o755))?;
    Ok(path)
}

fn config(image: &Path, runtime: &Path) -> Result<Config> {
    let raw = serde_json::json!({
        "images": {"tiny": {"rootfs": image}},
        "commands": {"true": {"image": "tiny", "command": "/bin/true"}},
        "runtime": runtime,
    });
    Ok(serde_json::from_value(raw)?)
}

fn launch(tmp: &Path, exit_code: i32) -> Result<(i32, PathBuf)> {
    let image = single_file_rootfs(tmp)?;
    let runtime = stub_runtime(tmp, exit_code)?;
    let config = config(&image, &runtime)?;

    let registry = OciRegistry::new(&config.insecure_registries, DockerCredentials::default())?;
    let cache = ImageCache::new(tmp.join("cache"), registry);
    let manager = BundleManager::new(cache, Provenance::default()).with_parent(tmp);
    let launcher = Launcher::locate(&config.runtime)?;

    let invocation = config.invocation("true", &[])?;
    let bundle = manager.materialize(&invocation, tmp)?;
    let bundle_path = bundle.path().to_path_buf();
    let code = launcher.run_with(bundle.path(), bundle.id(), Cursor::new(Vec::new()), io::sink())?;
    drop(bundle);

    Ok((code, bundle_path))
}

#[test]
#[serial]
fn test_single_file_image_runs_to_completion() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let (code, bundle_path) = launch(tmp.path(), 0)?;

    assert_eq!(code, 0);
    assert!(!bundle_path.exists(), "bundle should be removed");

    let spec: Spec = serde_json::from_reader(File::open(tmp.path().join("seen-config.json"))?)?;
    let process = spec.process().as_ref().context("no process")?;
    assert_eq!(process.args().as_ref().context("no args")?, &vec!["/bin/true"]);
    assert_eq!(process.cwd(), Path::new("/ark"));
    Ok(())
}

#[test]
#[serial]
fn test_container_failure_is_passed_through() -> Result<()> {
    let tmp = tempfile::tempdir()?;

    let (code, _) = launch(tmp.path(), 42)?;

    assert_eq!(code, 42);
    Ok(())
}

#[test]
#[serial]
fn test_interrupted_launch_still_removes_bundle() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let image = single_file_rootfs(tmp.path())?;
    let ready = tmp.path().join("ready");
    let runtime = tmp.path().join("slow-runc");
    fs::write(
        &runtime,
        format!(
            "#!/bin/sh\ntrap 'exit 0' TERM\ntouch \"{}\"\nwhile :; do sleep 1; done\n",
            ready.display()
        ),
    )?;
    fs::set_permissions(&runtime, Permissions::from_mode(0o755))?;
    let config = config(&image, &runtime)?;

    let registry = OciRegistry::new(&config.insecure_registries, DockerCredentials::default())?;
    let cache = ImageCache::new(tmp.path().join("cache"), registry);
    let manager = BundleManager::new(cache, Provenance::default()).with_parent(tmp.path());
    let launcher = Launcher::locate(&config.runtime)?;
    let invocation = config.invocation("true", &[])?;
    let bundle = manager.materialize(&invocation, tmp.path())?;
    let bundle_path = bundle.path().to_path_buf();

    let handle = thread::spawn(move || {
        let code = launcher.run_with(bundle.path(), bundle.id(), Cursor::new(Vec::new()), io::sink());
        drop(bundle);
        code
    });
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready.exists() {
        if Instant::now() > deadline {
            bail!("runtime never started");
        }
        thread::sleep(Duration::from_millis(10));
    }
    nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGTERM)?;

    let code = match handle.join() {
        Ok(code) => code?,
        Err(_) => bail!("launch thread panicked"),
    };
    assert_eq!(code, 128 + 15);
    assert!(!bundle_path.exists(), "bundle should be removed");
    Ok(())
}
