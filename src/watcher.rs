//! Per-process exit observation.
use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::wait::{WaitStatus, waitpid},
};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, mpsc::Sender},
    thread,
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::process::{ProcessEntry, target_pid};

/// Why a watched process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExitCause {
    /// The supervisor signalled it on purpose (Kill or Shutdown).
    Stopped,
    /// It died on its own.
    Exited,
}

/// Exit metadata captured when a watched process terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitRecord {
    /// Exit code returned by the process if it terminated normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Signal number if the process was terminated by a signal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Timestamp when the exit was observed.
    pub finished_at: DateTime<Utc>,
}

/// Notification that a watched pid has exited.
#[derive(Debug, Clone)]
pub struct TerminationEvent {
    pub entry: ProcessEntry,
    pub cause: ExitCause,
    pub exit: ExitRecord,
}

/// Pids the supervisor has deliberately signalled and whose exit must not be
/// mistaken for a crash.
#[derive(Debug, Clone, Default)]
pub struct StopLedger {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl StopLedger {
    /// Records that `pid` is being stopped on purpose.
    pub fn mark(&self, pid: u32) {
        self.pids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pid);
    }

    /// Withdraws a mark, e.g. when the signal could not be delivered.
    pub fn forget(&self, pid: u32) {
        self.take(pid);
    }

    /// Consumes the mark for `pid`, returning whether it was present.
    pub fn take(&self, pid: u32) -> bool {
        self.pids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid)
    }
}

/// Watches managed processes until they exit.
#[derive(Debug, Clone, Default)]
pub struct Watcher {
    ledger: StopLedger,
    exits: Arc<Mutex<HashMap<String, ExitRecord>>>,
}

impl Watcher {
    /// Creates a watcher that classifies exits against `ledger`.
    pub fn new(ledger: StopLedger) -> Self {
        Self {
            ledger,
            exits: Arc::default(),
        }
    }

    /// Waits for `entry.pid` to exit on a background thread.
    ///
    /// On exit the termination is recorded and, when `keep_alive` is set, forwarded on
    /// `terminated`. Whether to restart is not decided here.
    pub fn follow(
        &self,
        entry: ProcessEntry,
        terminated: Sender<TerminationEvent>,
        keep_alive: bool,
    ) -> thread::JoinHandle<()> {
        let watcher = self.clone();
        debug!("Watching '{}' [{}]...", entry.extension, entry.pid);

        thread::spawn(move || {
            let (code, signal) = wait_for_exit(&entry);
            let cause = if watcher.ledger.take(entry.pid) {
                ExitCause::Stopped
            } else {
                ExitCause::Exited
            };
            let exit = ExitRecord {
                code,
                signal,
                finished_at: Utc::now(),
            };

            match (code, signal) {
                (Some(code), _) => info!(
                    "Extension '{}' [{}] exited with code {code} ({cause})",
                    entry.extension, entry.pid
                ),
                (None, Some(signal)) => info!(
                    "Extension '{}' [{}] was terminated by signal {signal} ({cause})",
                    entry.extension, entry.pid
                ),
                (None, None) => info!(
                    "Extension '{}' [{}] exited with unknown status ({cause})",
                    entry.extension, entry.pid
                ),
            }

            watcher
                .exits
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(entry.extension.clone(), exit.clone());

            if keep_alive {
                let event = TerminationEvent { entry, cause, exit };
                if terminated.send(event).is_err() {
                    debug!("Termination channel closed; dropping exit notification");
                }
            }
        })
    }

    /// Returns the most recent exit observed for `extension`.
    pub fn last_exit(&self, extension: &str) -> Option<ExitRecord> {
        self.exits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(extension)
            .cloned()
    }
}

/// Blocks until the OS reports that `entry.pid` has exited.
fn wait_for_exit(entry: &ProcessEntry) -> (Option<i32>, Option<i32>) {
    let Some(pid) = target_pid(entry.pid) else {
        error!(
            "Refusing to wait on invalid PID {} for '{}'",
            entry.pid, entry.extension
        );
        return (None, None);
    };

    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return (Some(code), None),
            Ok(WaitStatus::Signaled(_, signal, _)) => return (None, Some(signal as i32)),
            Ok(status) => {
                debug!(
                    "Extension '{}' [{}] reported {status:?}; still waiting",
                    entry.extension, entry.pid
                );
            }
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                debug!(
                    "Extension '{}' [{}] already reaped before wait",
                    entry.extension, entry.pid
                );
                return (None, None);
            }
            Err(err) => {
                warn!(
                    "Error waiting for extension '{}' [{}]: {err}",
                    entry.extension, entry.pid
                );
                return (None, None);
            }
        }
    }
}
