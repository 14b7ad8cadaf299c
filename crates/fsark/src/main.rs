//! # fsark
//! Runs configured commands inside throwaway rootless containers.
//!
//! Installed under its own name it is an admin tool (`fsark run`, `fsark pull`,
//! ...). Installed as a symlink named after a configured command, every
//! argument is handed to that command inside its sandbox.
mod commands;
mod config_path;
mod observability;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{crate_version, Args, Parser, Subcommand};

use crate::observability::ObservabilityConfig;

/// Name the binary answers to as an admin tool.
const ADMIN_NAME: &str = "fsark";

/// output fsark version with the git commit it was built from
#[macro_export]
macro_rules! fsark_version {
    () => {
        concat!(
            "version ",
            crate_version!(),
            "\ncommit: ",
            env!("VERGEN_GIT_SHA")
        )
    };
}

#[derive(Parser, Debug)]
#[clap(name = ADMIN_NAME, version = fsark_version!(), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    #[clap(flatten)]
    global: GlobalOpts,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Args, Debug, Default)]
pub struct GlobalOpts {
    /// Configuration file to use instead of the default search path
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,
    /// Append logs to this file instead of stderr
    #[clap(long, global = true)]
    pub log: Option<PathBuf>,
    /// Log format, text or json
    #[clap(long, global = true)]
    pub log_format: Option<String>,
    /// Log level: error, warn, info, debug or trace
    #[clap(long, global = true)]
    pub log_level: Option<String>,
    /// Enable debug logging
    #[clap(long, global = true)]
    pub debug: bool,
    /// Also send logs to the systemd journal
    #[clap(long, global = true)]
    pub systemd_log: bool,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    Run(commands::run::Run),
    Pull(commands::pull::Pull),
    List(commands::list::List),
    Spec(commands::spec_json::SpecCmd),
    Info(commands::info::Info),
}

fn main() {
    let code = run(std::env::args_os().collect());
    // every bundle has been dropped by now
    std::process::exit(code);
}

fn run(args: Vec<OsString>) -> i32 {
    let invoked_as = args
        .first()
        .and_then(|arg0| Path::new(arg0).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ADMIN_NAME.to_owned());

    let result = if invoked_as == ADMIN_NAME {
        match Opts::try_parse_from(&args) {
            Ok(opts) => admin(opts),
            Err(err) => {
                // covers --help and --version as well as usage errors
                let _ = err.print();
                return err.exit_code();
            }
        }
    } else {
        dispatch(&invoked_as, &args[1..])
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            libfsark::launcher::INTERNAL_FAILURE
        }
    }
}

/// Runs the configured command named like the binary. Nothing is parsed as a
/// flag here, the arguments belong to the contained program.
fn dispatch(name: &str, args: &[OsString]) -> Result<i32> {
    if let Err(err) = observability::init(ObservabilityConfig::from_env()) {
        eprintln!("log init failed: {err:?}");
    }
    let args = args
        .iter()
        .map(|arg| {
            arg.to_str()
                .map(str::to_owned)
                .with_context(|| format!("argument {arg:?} is not valid UTF-8"))
        })
        .collect::<Result<Vec<_>>>()?;
    commands::run::launch(None, name, &args)
}

fn admin(opts: Opts) -> Result<i32> {
    if let Err(err) = observability::init(&opts.global) {
        eprintln!("log init failed: {err:?}");
    }
    tracing::debug!(
        euid = nix::unistd::geteuid().as_raw(),
        args = ?std::env::args_os().collect::<Vec<_>>(),
        "started"
    );

    let config = opts.global.config.as_deref();
    match opts.subcmd {
        SubCommand::Run(run) => commands::run::run(run, config),
        SubCommand::Pull(pull) => commands::pull::pull(pull, config).map(|_| 0),
        SubCommand::List(list) => commands::list::list(list, config).map(|_| 0),
        SubCommand::Spec(spec) => commands::spec_json::spec(spec, config).map(|_| 0),
        SubCommand::Info(info) => commands::info::info(info, config).map(|_| 0),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Opts::command().debug_assert();
    }

    #[test]
    fn test_run_passes_flags_through() {
        let opts = Opts::try_parse_from(["fsark", "--debug", "run", "python3", "-c", "--version"])
            .unwrap();
        assert!(opts.global.debug);
        match opts.subcmd {
            SubCommand::Run(run) => {
                assert_eq!(run.command, "python3");
                assert_eq!(run.args, vec!["-c", "--version"]);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let opts = Opts::try_parse_from(["fsark", "list", "--config", "/tmp/fsark.json"]).unwrap();
        assert_eq!(opts.global.config, Some(PathBuf::from("/tmp/fsark.json")));
    }

    #[test]
    fn test_usage_error_exit_code() {
        assert_eq!(run(vec!["fsark".into(), "frobnicate".into()]), 2);
    }

    #[test]
    fn test_unknown_admin_flag_is_rejected() {
        assert!(Opts::try_parse_from(["fsark", "--no-such-flag", "info"]).is_err());
    }
}
