//! Constants and default configuration values for the supervisor.

use nix::sys::signal::Signal;
use std::time::Duration;

// ============================================================================
// Control Endpoint
// ============================================================================

/// Host the control endpoint binds to when none is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Port the control endpoint binds to when none is configured.
pub const DEFAULT_PORT: u16 = 10666;

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the registry file placed in the temp directory by default.
pub const REGISTRY_FILE_NAME: &str = ".pman";

/// Lock file suffix for the registry file to ensure exclusive access across processes.
pub const REGISTRY_LOCK_SUFFIX: &str = ".lock";

/// Suffix of the scratch file written before atomically replacing the registry.
pub const REGISTRY_TMP_SUFFIX: &str = ".tmp";

/// Contents written to a freshly created registry.
pub const EMPTY_REGISTRY: &str = "{}";

// ============================================================================
// Supervision Timing
// ============================================================================

/// Default interval between Janitor reconciliation passes.
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound Shutdown waits for in-flight starts to drain.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Minimum spacing between two restarts of the same extension under keep-alive.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Default signal delivered by Kill and Shutdown.
pub const DEFAULT_STOP_SIGNAL: Signal = Signal::SIGKILL;

// ============================================================================
// Environment Variables
// ============================================================================

pub const ENV_HOST: &str = "RUNTIME_HOST";
pub const ENV_PORT: &str = "RUNTIME_PORT";
pub const ENV_REGISTRY_FILE: &str = "RUNTIME_DB_FILE";
pub const ENV_KEEP_ALIVE: &str = "RUNTIME_KEEP_ALIVE";
pub const ENV_JANITOR_INTERVAL: &str = "RUNTIME_JANITOR_INTERVAL";
pub const ENV_BINARY: &str = "RUNTIME_BINARY";
pub const ENV_STOP_SIGNAL: &str = "RUNTIME_STOP_SIGNAL";
