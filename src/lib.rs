//! pman supervises the extension processes of a host runtime. Each extension is a
//! child process launched from a fixed binary; pman records extension-to-pid
//! assignments in a persisted registry, reaps exits, optionally restarts extensions
//! that die on their own, and sweeps dead entries out of the registry.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Defaults and timing constants.
pub mod constants;

/// Start, kill, list and shutdown orchestration.
pub mod controller;

/// Error handling.
pub mod error;

/// Control protocol spoken between CLI invocations and the supervisor.
pub mod ipc;

/// Periodic reconciliation of the registry against live processes.
pub mod janitor;

/// Extension processes and the OS process table.
pub mod process;

/// Persisted extension-to-pid map.
pub mod registry;

/// Control-operation server.
pub mod service;

/// Listing renderers.
pub mod status;

/// Exit observation for spawned extensions.
pub mod watcher;
