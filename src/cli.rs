//! Command-line interface for pman.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{Config, parse_interval, parse_signal},
    error::ConfigError,
};

/// Numeric shorthands accepted by `--log-level`, indexed by verbosity.
const NUMERIC_LEVELS: [LevelFilter; 6] = [
    LevelFilter::OFF,
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// Directive suitable for an `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<usize>() {
            return NUMERIC_LEVELS
                .get(number)
                .copied()
                .map(LogLevelArg)
                .ok_or_else(|| format!("unsupported log level number '{number}' (expected 0-5)"));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for pman.
#[derive(Debug, Parser)]
#[command(name = "pman", version, author)]
#[command(about = "Supervises extension processes of a host runtime", long_about = None)]
pub struct Cli {
    /// Control endpoint host.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Control endpoint port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Optional YAML configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for pman.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the supervisor in the foreground.
    Serve {
        /// Registry file location.
        #[arg(long, value_name = "FILE")]
        registry_file: Option<PathBuf>,

        /// Restart extensions that exit on their own.
        #[arg(long)]
        keep_alive: bool,

        /// Interval between Janitor passes, e.g. `500ms` or `2s`.
        #[arg(long, value_name = "DURATION")]
        janitor_interval: Option<String>,

        /// Host runtime binary extensions are launched with.
        #[arg(long)]
        binary: Option<String>,

        /// Signal delivered by kill and shutdown, e.g. `SIGTERM`.
        #[arg(long, value_name = "SIGNAL")]
        stop_signal: Option<String>,
    },

    /// Start an extension.
    Run {
        /// Extension name.
        extension: String,

        /// Arguments passed to the binary; defaults to the extension name.
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Stop an extension and forget it.
    Kill {
        /// Extension name.
        extension: String,
    },

    /// List managed extensions.
    List {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Overlays command-line flags, the highest-precedence configuration layer.
    pub fn apply_to(&self, config: &mut Config) -> Result<(), ConfigError> {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }

        if let Commands::Serve {
            registry_file,
            keep_alive,
            janitor_interval,
            binary,
            stop_signal,
        } = &self.command
        {
            if let Some(path) = registry_file {
                config.registry_file = path.clone();
            }
            if *keep_alive {
                config.keep_alive = true;
            }
            if let Some(raw) = janitor_interval {
                config.janitor_interval = parse_interval("--janitor-interval", raw)?;
            }
            if let Some(binary) = binary {
                config.binary = Some(binary.clone());
            }
            if let Some(raw) = stop_signal {
                config.stop_signal = parse_signal("--stop-signal", raw)?;
            }
        }
        Ok(())
    }
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
