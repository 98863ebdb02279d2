//! Configuration management for pman.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `RUNTIME_*` environment variables, then command-line flags.
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

use crate::{
    constants::{
        DEFAULT_HOST, DEFAULT_JANITOR_INTERVAL, DEFAULT_PORT, DEFAULT_SHUTDOWN_GRACE,
        DEFAULT_STOP_SIGNAL, ENV_BINARY, ENV_HOST, ENV_JANITOR_INTERVAL, ENV_KEEP_ALIVE,
        ENV_PORT, ENV_REGISTRY_FILE, ENV_STOP_SIGNAL, REGISTRY_FILE_NAME,
    },
    controller::ControllerOptions,
    error::{ConfigError, ControllerError},
};

/// Effective supervisor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Host the control endpoint binds to (server) or dials (client).
    pub host: String,
    /// Control endpoint port.
    pub port: u16,
    /// Registry file location.
    pub registry_file: PathBuf,
    /// Restart extensions that exit on their own.
    pub keep_alive: bool,
    /// Interval between Janitor passes.
    pub janitor_interval: Duration,
    /// Host runtime binary; `None` means the supervisor's own executable.
    pub binary: Option<String>,
    /// Signal delivered by Kill and Shutdown.
    pub stop_signal: Signal,
    /// Upper bound Shutdown waits for in-flight starts.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            registry_file: std::env::temp_dir().join(REGISTRY_FILE_NAME),
            keep_alive: false,
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
            binary: None,
            stop_signal: DEFAULT_STOP_SIGNAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Shape of the optional YAML configuration file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub registry_file: Option<PathBuf>,
    pub keep_alive: Option<bool>,
    pub janitor_interval: Option<String>,
    pub binary: Option<String>,
    pub stop_signal: Option<String>,
    pub shutdown_grace: Option<String>,
}

impl Config {
    /// Defaults, overlaid with `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.apply_file(load_file(path)?)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Address of the control endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Overlays values present in a parsed configuration file.
    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(registry_file) = file.registry_file {
            self.registry_file = registry_file;
        }
        if let Some(keep_alive) = file.keep_alive {
            self.keep_alive = keep_alive;
        }
        if let Some(raw) = file.janitor_interval {
            self.janitor_interval = parse_interval("janitor-interval", &raw)?;
        }
        if let Some(binary) = file.binary {
            self.binary = Some(binary);
        }
        if let Some(raw) = file.stop_signal {
            self.stop_signal = parse_signal("stop-signal", &raw)?;
        }
        if let Some(raw) = file.shutdown_grace {
            self.shutdown_grace = parse_duration("shutdown-grace", &raw)?;
        }
        Ok(())
    }

    /// Overlays `RUNTIME_*` variables as returned by `lookup`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = var(ENV_HOST) {
            self.host = host;
        }
        if let Some(raw) = var(ENV_PORT) {
            self.port = raw.trim().parse().map_err(|_| invalid(ENV_PORT, &raw, "not a port"))?;
        }
        if let Some(raw) = var(ENV_REGISTRY_FILE) {
            self.registry_file = PathBuf::from(raw);
        }
        if let Some(raw) = var(ENV_KEEP_ALIVE) {
            self.keep_alive =
                parse_bool(&raw).ok_or_else(|| invalid(ENV_KEEP_ALIVE, &raw, "not a boolean"))?;
        }
        if let Some(raw) = var(ENV_JANITOR_INTERVAL) {
            self.janitor_interval = parse_interval(ENV_JANITOR_INTERVAL, &raw)?;
        }
        if let Some(binary) = var(ENV_BINARY) {
            self.binary = Some(binary);
        }
        if let Some(raw) = var(ENV_STOP_SIGNAL) {
            self.stop_signal = parse_signal(ENV_STOP_SIGNAL, &raw)?;
        }
        Ok(())
    }

    /// Resolves the binary and derives the options a Controller is built from.
    pub fn controller_options(&self) -> Result<ControllerOptions, ControllerError> {
        let binary = match &self.binary {
            Some(binary) => binary.clone(),
            None => {
                let own = std::env::current_exe()
                    .map_err(|source| ControllerError::SpawnFailure {
                        extension: "<self>".into(),
                        source,
                    })?
                    .to_string_lossy()
                    .into_owned();
                warn!(
                    "No binary configured; extensions will be launched as subcommands of {own}. \
                     Set --binary or {ENV_BINARY} to use a different runtime."
                );
                own
            }
        };

        Ok(ControllerOptions::new(binary)?
            .with_keep_alive(self.keep_alive)
            .with_registry_file(&self.registry_file)
            .with_janitor_interval(self.janitor_interval)
            .with_stop_signal(self.stop_signal)
            .with_shutdown_grace(self.shutdown_grace))
    }
}

/// Reads and parses a YAML configuration file.
pub fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;
    if content.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    Ok(serde_yaml::from_str(&content)?)
}

/// Parses a duration in the format `<number>[ms|s|m|h]`; bare numbers are seconds.
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(invalid(key, raw, "duration cannot be empty"));
    }

    let (amount_str, unit) = if let Some(stripped) = value.strip_suffix("ms") {
        (stripped.trim(), Duration::from_millis(1))
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), Duration::from_secs(1))
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), Duration::from_secs(60))
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), Duration::from_secs(3600))
    } else {
        (value, Duration::from_secs(1))
    };

    let amount: u32 = amount_str
        .parse()
        .map_err(|_| invalid(key, raw, "expected <number>[ms|s|m|h]"))?;

    Ok(unit * amount)
}

/// Like [`parse_duration`], but rejects zero. Used for loop periods.
pub fn parse_interval(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let interval = parse_duration(key, raw)?;
    if interval.is_zero() {
        return Err(invalid(key, raw, "interval must be positive"));
    }
    Ok(interval)
}

/// Parses the usual spellings of a boolean flag.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses a signal name such as `SIGTERM`, `term` or `KILL`.
pub fn parse_signal(key: &str, raw: &str) -> Result<Signal, ConfigError> {
    let upper = raw.trim().to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| invalid(key, raw, "unknown signal"))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
