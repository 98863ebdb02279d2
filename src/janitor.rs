//! Timer-driven reconciliation of the registry against the OS process table.
//!
//! A process killed with SIGKILL by someone else, or left behind by a previous
//! supervisor incarnation, is never observed by a [`crate::watcher::Watcher`]. The
//! only way to drop such orphans from the registry is by polling.
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{error::RegistryError, process::LivenessProbe, registry::Storage};

/// Entries the Janitor removed, so a late restart can tell a reclaimed crash from
/// an operator Kill.
#[derive(Debug, Clone, Default)]
pub struct ReclaimLog {
    entries: Arc<Mutex<HashSet<(String, u32)>>>,
}

impl ReclaimLog {
    pub fn record(&self, extension: &str, pid: u32) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((extension.to_string(), pid));
    }

    /// Consumes the record for `extension` at `pid`, returning whether it was present.
    pub fn take(&self, extension: &str, pid: u32) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(extension.to_string(), pid))
    }
}

/// Periodic orphan reclaimer.
pub struct Janitor {
    registry: Arc<dyn Storage>,
    probe: Arc<dyn LivenessProbe>,
    interval: Duration,
    reclaimed: Option<ReclaimLog>,
}

impl Janitor {
    pub fn new(
        registry: Arc<dyn Storage>,
        probe: Arc<dyn LivenessProbe>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            interval,
            reclaimed: None,
        }
    }

    /// Records every removal in `log`, inside the same transaction as the removal.
    pub fn with_reclaim_log(mut self, log: ReclaimLog) -> Self {
        self.reclaimed = Some(log);
        self
    }

    /// Runs one reconciliation pass, returning the orphans it removed.
    ///
    /// Probing and removal happen inside a single registry transaction.
    pub fn sweep(&self) -> Result<Vec<(String, u32)>, RegistryError> {
        let mut reclaimed = Vec::new();
        self.registry.transact(&mut |entries| {
            entries.retain(|extension, pid| {
                let alive = self.probe.is_alive(*pid);
                if !alive {
                    if let Some(log) = &self.reclaimed {
                        log.record(extension, *pid);
                    }
                    reclaimed.push((extension.clone(), *pid));
                }
                alive
            });
            !reclaimed.is_empty()
        })?;

        for (extension, pid) in &reclaimed {
            info!("Deleting orphaned extension '{extension}' with pid {pid}");
        }
        Ok(reclaimed)
    }

    /// Starts the reconciliation loop on a background thread.
    pub fn spawn(self) -> JanitorHandle {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            debug!("Janitor started with interval {:?}", self.interval);
            loop {
                match stopped.recv_timeout(self.interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = self.sweep() {
                            warn!("Janitor pass failed, retrying next interval: {err}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Janitor loop terminating.");
        });

        JanitorHandle {
            stop: Mutex::new(Some(stop)),
            handle: Mutex::new(Some(handle)),
        }
    }
}

/// Control over a running Janitor loop.
///
/// The loop ends when [`JanitorHandle::stop`] is called, which the supervisor does
/// from its termination-signal handler, or when the handle is dropped.
pub struct JanitorHandle {
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl JanitorHandle {
    /// Stops the loop and waits for it to finish. Idempotent.
    pub fn stop(&self) {
        if let Some(stop) = self
            .stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = stop.send(());
        }

        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            let _ = handle.join();
        }
    }

    /// Returns `true` while the loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
