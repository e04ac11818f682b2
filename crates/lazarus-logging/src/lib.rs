// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup for lazarus binaries
//!
//! Everything logs through `tracing`. This crate installs the subscriber:
//! plaintext or JSON, to stderr or to a file, filtered by `RUST_LOG` when it
//! is set and by the command-line level otherwise. Protocol tracing turns on
//! the per-request and per-reply events the session engine emits under the
//! `lazarus::request` and `lazarus::reply` targets.
//!
//! The subscriber is installed once, before the supervisor forks; worker
//! processes inherit it.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use clap;
pub use tracing::Level;

/// Targets carrying one event per request and per reply
pub const PROTOCOL_TARGETS: [&str; 2] = ["lazarus::request", "lazarus::reply"];

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Log level as accepted on the command line
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Logging flags shared by every lazarus binary.
///
/// Use with `#[command(flatten)]`. Logs go to stderr unless `--log-file` or
/// `--log-dir` is given.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level (default: info)
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    /// Log output format (default: plaintext)
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Directory for log files
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Log filename, relative to --log-dir when that is given
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl CliLoggingArgs {
    /// Install the global subscriber for `component`.
    ///
    /// `trace_protocol` enables the per-request and per-reply events
    /// regardless of the chosen level.
    pub fn init(&self, component: &str, trace_protocol: bool) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();
        match self.resolve_log_path(component) {
            Some(path) => init_to_file(component, level, format, trace_protocol, &path),
            None => init(component, level, format, trace_protocol),
        }
    }

    /// Where file logging should go, or `None` for stderr.
    pub fn resolve_log_path(&self, component: &str) -> Option<PathBuf> {
        match (&self.log_file, &self.log_dir) {
            (Some(file), _) if Path::new(file).is_absolute() => Some(PathBuf::from(file)),
            (Some(file), Some(dir)) => Some(Path::new(dir).join(file)),
            (Some(file), None) => Some(PathBuf::from(file)),
            (None, Some(dir)) => Some(Path::new(dir).join(format!("{}.log", component))),
            (None, None) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log_level.is_none()
            && self.log_format.is_none()
            && self.log_dir.is_none()
            && self.log_file.is_none()
    }
}

/// Default log file location for `component`.
///
/// Linux: `~/.local/share/lazarus/<component>.log`, falling back to the home
/// directory and then `/tmp`.
pub fn standard_log_path(component: &str) -> PathBuf {
    let mut path = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")));
    path.push("lazarus");
    path.push(format!("{}.log", component));
    path
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_directives(component: &str, level: Level, trace_protocol: bool) -> String {
    // Targets are module paths, which use underscores
    let target = component.replace('-', "_");
    let mut directives = format!("{},{}={}", level, target, level);
    if trace_protocol {
        for protocol in PROTOCOL_TARGETS {
            directives.push_str(&format!(",{}=debug", protocol));
        }
    }
    directives.to_lowercase()
}

/// Log to stderr.
pub fn init(
    component: &str,
    default_level: Level,
    format: LogFormat,
    trace_protocol: bool,
) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, trace_protocol, io::stderr)
}

/// Log to `log_path`, creating parent directories as needed.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    trace_protocol: bool,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    init_with_writer(component, default_level, format, trace_protocol, log_file)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    trace_protocol: bool,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(default_directives(component, default_level, trace_protocol))
    });

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_thread_names(true)
                .with_ansi(false);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_log_level_conversion() {
        assert_eq!(Level::from(CliLogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(CliLogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(CliLogLevel::Info), Level::INFO);
        assert_eq!(Level::from(CliLogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(CliLogLevel::Trace), Level::TRACE);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("plaintext".parse::<LogFormat>(), Ok(LogFormat::Plaintext));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives("lazarus-passthrough", Level::WARN, false),
            "warn,lazarus_passthrough=warn"
        );
        let traced = default_directives("lazarus-passthrough", Level::INFO, true);
        assert!(traced.ends_with(",lazarus::request=debug,lazarus::reply=debug"));
    }

    #[test]
    fn test_console_logging_without_file_options() {
        let args = CliLoggingArgs::default();
        assert!(args.is_empty());
        assert_eq!(args.resolve_log_path("lazarus"), None);
    }

    #[test]
    fn test_log_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_string_lossy().into_owned();

        let args = CliLoggingArgs {
            log_dir: Some(dir_str.clone()),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("lazarus"),
            Some(dir.path().join("lazarus.log"))
        );

        let args = CliLoggingArgs {
            log_dir: Some(dir_str),
            log_file: Some("fs/daemon.log".to_string()),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("lazarus"),
            Some(dir.path().join("fs/daemon.log"))
        );

        let absolute = dir.path().join("abs.log");
        let args = CliLoggingArgs {
            log_dir: Some("/ignored".to_string()),
            log_file: Some(absolute.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("lazarus"), Some(absolute));
    }

    #[test]
    fn test_standard_log_path() {
        let path = standard_log_path("lazarus-passthrough");
        assert!(path.ends_with("lazarus/lazarus-passthrough.log"));
    }
}
