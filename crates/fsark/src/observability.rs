use std::borrow::Cow;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";

/// Logging settings for launches through a command symlink, where every
/// argument belongs to the contained program.
pub const LOG_FILE_ENV: &str = "FSARK_LOG";
pub const LOG_FORMAT_ENV: &str = "FSARK_LOG_FORMAT";
pub const LOG_LEVEL_ENV: &str = "FSARK_LOG_LEVEL";

#[derive(Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// If in debug mode, default level is debug to get maximum logging
#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

/// If not in debug mode, default level is error to get important logs
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "error";

/// Stderr is shared with the container when launched through a command
/// symlink, so only errors are logged unless asked otherwise.
const SYMLINK_LOG_LEVEL: &str = "error";

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

fn detect_log_level(input: Option<String>, is_debug: bool) -> Result<Level> {
    // `--log-level` wins over `--debug` when both are given
    let log_level: Cow<str> = match input {
        None if is_debug => "debug".into(),
        None => DEFAULT_LOG_LEVEL.into(),
        Some(level) => level.into(),
    };

    Ok(Level::from_str(log_level.as_ref())?)
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub log_debug_flag: bool,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
    pub systemd_log: bool,
}

impl From<&crate::GlobalOpts> for ObservabilityConfig {
    fn from(opts: &crate::GlobalOpts) -> Self {
        Self {
            log_debug_flag: opts.debug,
            log_level: opts.log_level.to_owned(),
            log_file: opts.log.to_owned(),
            log_format: opts.log_format.to_owned(),
            systemd_log: opts.systemd_log,
        }
    }
}

impl ObservabilityConfig {
    /// Settings from `FSARK_LOG`, `FSARK_LOG_FORMAT` and `FSARK_LOG_LEVEL`.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());
        Self {
            log_file: var(LOG_FILE_ENV).map(PathBuf::from),
            log_format: var(LOG_FORMAT_ENV),
            log_level: Some(var(LOG_LEVEL_ENV).unwrap_or_else(|| SYMLINK_LOG_LEVEL.to_owned())),
            ..Default::default()
        }
    }
}

/// Installs the global subscriber. Nothing is ever written to stdout, which
/// carries the container's output.
pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let level = detect_log_level(config.log_level, config.log_debug_flag)
        .with_context(|| "failed to parse log level")?;
    let log_level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let log_format = detect_log_format(config.log_format.as_deref())
        .with_context(|| "failed to detect log format")?;

    let systemd_journald = if config.systemd_log {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_syslog_identifier("fsark".to_string())),
            Err(err) => {
                // journald is optional, e.g. inside containers without it
                eprintln!("failed to initialize syslog logging: {:?}", err);
                None
            }
        }
    } else {
        None
    };
    let subscriber = tracing_subscriber::registry()
        .with(log_level_filter)
        .with(systemd_journald);

    // each writer/format pair is a distinct layer type
    match (config.log_file.as_ref(), log_format) {
        (None, LogFormat::Text) => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .without_time()
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        (None, LogFormat::Json) => {
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        (Some(path), LogFormat::Text) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path:?}"))?;
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(file),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
        (Some(path), LogFormat::Json) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path:?}"))?;
            subscriber
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_span_list(false)
                        .with_writer(file),
                )
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_detect_log_level() {
        let test = vec![
            ("error", tracing::Level::ERROR),
            ("warn", tracing::Level::WARN),
            ("info", tracing::Level::INFO),
            ("debug", tracing::Level::DEBUG),
            ("trace", tracing::Level::TRACE),
        ];
        for (input, expected) in test {
            assert_eq!(
                detect_log_level(Some(input.to_string()), false)
                    .expect("failed to parse log level"),
                expected
            )
        }
        assert_eq!(
            detect_log_level(None, true).expect("failed to parse log level"),
            tracing::Level::DEBUG
        );
        assert_eq!(
            detect_log_level(Some("warn".to_string()), true).expect("failed to parse log level"),
            tracing::Level::WARN
        );
        assert!(detect_log_level(Some("invalid".to_string()), false).is_err());
    }

    #[test]
    fn test_detect_log_level_default() {
        let expected = if cfg!(debug_assertions) {
            tracing::Level::DEBUG
        } else {
            tracing::Level::ERROR
        };
        assert_eq!(detect_log_level(None, false).unwrap(), expected);
    }

    #[test]
    fn test_detect_log_format() {
        assert_eq!(detect_log_format(None).unwrap(), LogFormat::Text);
        assert_eq!(detect_log_format(Some("text")).unwrap(), LogFormat::Text);
        assert_eq!(detect_log_format(Some("json")).unwrap(), LogFormat::Json);
        assert!(detect_log_format(Some("xml")).is_err());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        let saved: Vec<_> = [LOG_FILE_ENV, LOG_FORMAT_ENV, LOG_LEVEL_ENV]
            .into_iter()
            .map(|name| (name, std::env::var_os(name)))
            .collect();
        let _restore = scopeguard::guard(saved, |saved| {
            for (name, value) in saved {
                match value {
                    Some(value) => std::env::set_var(name, value),
                    None => std::env::remove_var(name),
                }
            }
        });

        std::env::set_var(LOG_FILE_ENV, "/var/log/fsark.log");
        std::env::set_var(LOG_FORMAT_ENV, "json");
        std::env::set_var(LOG_LEVEL_ENV, "");
        let config = ObservabilityConfig::from_env();

        assert_eq!(config.log_file, Some(PathBuf::from("/var/log/fsark.log")));
        assert_eq!(config.log_format.as_deref(), Some("json"));
        assert_eq!(config.log_level.as_deref(), Some("error"));
        assert!(!config.log_debug_flag);
        assert!(!config.systemd_log);

        std::env::set_var(LOG_LEVEL_ENV, "debug");
        let config = ObservabilityConfig::from_env();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_symlink_launch_defaults_to_errors_only() {
        assert_eq!(
            detect_log_level(Some(SYMLINK_LOG_LEVEL.to_owned()), false).unwrap(),
            tracing::Level::ERROR
        );
    }
}
