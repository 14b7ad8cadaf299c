//! Contains functionality of the list command
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::Path;

use anyhow::Result;
use clap::Parser;
use libfsark::config::Config;
use tabwriter::TabWriter;

/// List configured commands and images
#[derive(Parser, Debug)]
pub struct List {}

pub fn list(_: List, config: Option<&Path>) -> Result<()> {
    let (_, config) = super::load_config(config)?;
    write_listing(&config, io::stdout().lock())
}

fn write_listing<W: Write>(config: &Config, output: W) -> Result<()> {
    let mut commands = String::new();
    for (name, profile) in &config.commands {
        let _ = writeln!(
            commands,
            "{}\t{}\t{}\t{}",
            name,
            profile.image,
            profile.networking,
            profile.argv(&[]).join(" ")
        );
    }

    let mut images = String::new();
    for (name, image) in &config.images {
        let _ = writeln!(images, "{}\t{}\t{}", name, image.rootfs, image.tags.join(","));
    }

    let mut tab_writer = TabWriter::new(output);
    writeln!(&mut tab_writer, "COMMAND\tIMAGE\tNETWORKING\tCOMMAND LINE")?;
    write!(&mut tab_writer, "{commands}")?;
    writeln!(&mut tab_writer)?;
    writeln!(&mut tab_writer, "IMAGE\tROOTFS\tTAGS")?;
    write!(&mut tab_writer, "{images}")?;
    tab_writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_listing() -> Result<()> {
        let config = Config::parse(
            r#"{
                "images": {"alpine": {"rootfs": "docker.io/library/alpine:3.19", "tags": ["latest", "edge"]}},
                "commands": {
                    "python3": {"image": "alpine", "command": "/usr/bin/python3", "command_start": ["-I"]},
                    "curl": {"image": "alpine", "command": "/usr/bin/curl", "networking": "host"}
                }
            }"#,
        )?;
        let mut output = Vec::new();

        write_listing(&config, &mut output)?;

        let output = String::from_utf8(output)?;
        let lines: Vec<&str> = output.lines().map(str::trim_end).collect();
        assert!(lines[0].starts_with("COMMAND"));
        assert!(lines[1].starts_with("curl "));
        assert!(lines[1].contains("host"));
        assert!(lines[2].starts_with("python3 "));
        assert!(lines[2].ends_with("/usr/bin/python3 -I"));
        assert!(lines[2].contains("none"));
        assert_eq!(lines[3], "");
        assert!(lines[4].starts_with("IMAGE"));
        assert!(lines[5].starts_with("alpine "));
        assert!(lines[5].ends_with("latest,edge"));
        Ok(())
    }

    #[test]
    fn test_write_listing_empty_config() -> Result<()> {
        let mut output = Vec::new();

        write_listing(&Config::parse("{}")?, &mut output)?;

        let output = String::from_utf8(output)?;
        assert_eq!(output.lines().count(), 3);
        Ok(())
    }
}
