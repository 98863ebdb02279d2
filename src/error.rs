//! Error handling for pman.
use thiserror::Error;

/// Defines all possible errors raised by the supervision engine.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The extension has no entry in the registry.
    #[error("pid for extension '{0}' not found")]
    NotFound(String),

    /// The OS refused to create the extension process.
    #[error("Failed to start extension '{extension}': {source}")]
    SpawnFailure {
        /// The extension that failed to start.
        extension: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Delivering a signal to a managed process failed.
    #[error("Failed to signal extension '{extension}' (pid {pid}): {source}")]
    Signal {
        /// The extension being signalled.
        extension: String,
        /// The pid the signal was addressed to.
        pid: u32,
        /// The errno reported by the kernel.
        #[source]
        source: nix::errno::Errno,
    },

    /// The configured binary could not be located.
    #[error("binary '{binary}' not present on `$PATH`: {source}")]
    BinaryNotFound {
        /// The binary name as configured.
        binary: String,
        /// The lookup failure.
        #[source]
        source: which::Error,
    },

    /// Registry read or write failure.
    #[error("Registry error: {0}")]
    Storage(#[from] RegistryError),

    /// The controller no longer accepts new work.
    #[error("controller is shutting down")]
    ShuttingDown,

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for ControllerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ControllerError::MutexPoisonError(err.to_string())
    }
}

/// Error type for registry file operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Error reading the registry file.
    #[error("Failed to read registry file: {0}")]
    Read(#[source] std::io::Error),

    /// Error parsing the registry contents.
    #[error("Failed to parse registry file: {0}")]
    Parse(#[from] serde_json::Error),

    /// Error persisting the registry.
    #[error("Failed to write registry file: {0}")]
    Write(#[source] std::io::Error),

    /// Error acquiring the cross-process lock on the registry.
    #[error("Failed to lock registry file: {0}")]
    Lock(#[source] std::io::Error),

    /// The in-process registry lock was poisoned by a panicking writer.
    #[error("Registry lock is poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for RegistryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        RegistryError::Poisoned(err.to_string())
    }
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A configuration value could not be interpreted.
    #[error("Invalid value '{value}' for '{key}': {reason}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// The offending raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}
