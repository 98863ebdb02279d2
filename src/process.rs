//! Managed process entries and the OS process capabilities the supervisor relies on.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use std::{
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
};
use tracing::debug;

use crate::error::ControllerError;

/// One managed extension process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// Unique extension name; the registry key.
    pub extension: String,
    /// Arguments passed to the host binary.
    pub args: Vec<String>,
    /// Set a posteriori, once the OS has spawned the process.
    #[serde(default)]
    pub pid: u32,
}

impl ProcessEntry {
    /// Creates an entry that has not been spawned yet.
    pub fn new<I, S>(extension: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extension: extension.into(),
            args: args.into_iter().map(Into::into).collect(),
            pid: 0,
        }
    }

    /// Spawns `binary` with this entry's arguments and records the resulting pid.
    ///
    /// The child inherits the supervisor's standard streams and is placed in its own
    /// process group, so signals delivered to the supervisor's group do not reach it.
    /// The child is not waited on here; reaping belongs to the [`crate::watcher::Watcher`].
    pub fn spawn(&mut self, binary: &Path) -> Result<u32, ControllerError> {
        debug!(
            "Launching extension '{}': {} {:?}",
            self.extension,
            binary.display(),
            self.args
        );

        let child = Command::new(binary)
            .args(&self.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|source| ControllerError::SpawnFailure {
                extension: self.extension.clone(),
                source,
            })?;

        self.pid = child.id();
        debug!("Extension '{}' started with PID: {}", self.extension, self.pid);
        Ok(self.pid)
    }
}

/// Converts a stored pid into a signal target.
///
/// Zero and values beyond `pid_t` would address whole process groups (or every
/// process) through `kill(2)`, so they are rejected.
pub fn target_pid(pid: u32) -> Option<Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(Pid::from_raw(pid as i32))
}

/// Answers whether a process still exists, without affecting it.
pub trait LivenessProbe: Send + Sync {
    /// Returns `true` while `pid` refers to an existing process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// The OS process table as seen by the supervisor: liveness plus signal delivery.
pub trait ProcessTable: LivenessProbe {
    /// Delivers `signal` to `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno>;
}

/// [`ProcessTable`] backed by `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl LivenessProbe for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(target) = target_pid(pid) else {
            return false;
        };

        match signal::kill(target, None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // The process exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(err) => {
                debug!("Liveness probe for PID {pid} failed with {err}; assuming alive");
                true
            }
        }
    }
}

impl ProcessTable for SystemProcesses {
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), Errno> {
        let target = target_pid(pid).ok_or(Errno::ESRCH)?;
        signal::kill(target, signal)
    }
}
