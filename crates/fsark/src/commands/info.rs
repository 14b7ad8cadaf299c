//! Contains functions related to printing information about this fsark
//! installation
use std::path::Path;

use anyhow::Result;
use clap::Parser;
use libfsark::config::{Config, DEFAULT_RUNTIME};
use libfsark::image::default_cache_root;
use libfsark::launcher::Launcher;

use crate::config_path;

/// Show information about this installation
#[derive(Parser, Debug)]
pub struct Info {}

pub fn info(_: Info, config: Option<&Path>) -> Result<()> {
    print_fsark();
    print_cache();
    let runtime = print_config(config);
    print_runtime(&runtime);

    Ok(())
}

/// print version of fsark
pub fn print_fsark() {
    println!("{:<18}{}", "Version", env!("CARGO_PKG_VERSION"));
    println!("{:<18}{}", "Commit", env!("VERGEN_GIT_SHA"));
}

pub fn print_cache() {
    match default_cache_root() {
        Ok(root) => println!("{:<18}{}", "Image cache", root.display()),
        Err(err) => println!("{:<18}<{}>", "Image cache", err),
    }
}

/// Prints where the configuration was found and returns the runtime it names
pub fn print_config(explicit: Option<&Path>) -> String {
    let path = match config_path::locate(explicit) {
        Ok(path) => path,
        Err(err) => {
            println!("{:<18}<{}>", "Config", err);
            return DEFAULT_RUNTIME.to_owned();
        }
    };
    println!("{:<18}{}", "Config", path.display());

    match Config::load(&path) {
        Ok(config) => {
            println!("{:<18}{}", "Commands", config.commands.len());
            println!("{:<18}{}", "Images", config.images.len());
            config.runtime
        }
        Err(err) => {
            println!("{:<18}<{}>", "Config error", err);
            DEFAULT_RUNTIME.to_owned()
        }
    }
}

pub fn print_runtime(configured: &str) {
    match Launcher::from_env(configured) {
        Ok(launcher) => println!("{:<18}{}", "Runtime", launcher.runtime().display()),
        Err(err) => println!("{:<18}<{}>", "Runtime", err),
    }
}
