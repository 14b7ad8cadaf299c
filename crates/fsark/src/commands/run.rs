use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use libfsark::launcher::Launcher;

/// Run a configured command in a fresh container
#[derive(Parser, Debug)]
pub struct Run {
    /// Name of the command in the configuration
    pub command: String,
    /// Arguments appended to the command line
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn run(args: Run, config: Option<&Path>) -> Result<i32> {
    launch(config, &args.command, &args.args)
}

/// Runs command `name` with `args` and returns the exit code to leave with.
/// The bundle is gone by the time this returns.
pub fn launch(config: Option<&Path>, name: &str, args: &[String]) -> Result<i32> {
    let (path, config) = super::load_config(config)?;
    let invocation = config
        .invocation(name, args)
        .with_context(|| format!("failed to resolve command {name:?} from {path:?}"))?;
    let launcher = Launcher::from_env(&config.runtime)?;
    let manager = super::bundle_manager(&config)?;

    let cwd = std::env::current_dir().context("failed to get the current directory")?;
    let bundle = manager
        .materialize(&invocation, &cwd)
        .with_context(|| format!("failed to prepare the container for {name:?}"))?;
    let code = launcher
        .run(&bundle)
        .with_context(|| format!("failed to run {name:?} with {:?}", launcher.runtime()))?;
    tracing::debug!(command = name, code, "container exited");
    Ok(code)
}
