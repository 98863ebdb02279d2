//! Lifecycle orchestration for managed extensions.
use nix::{errno::Errno, sys::signal::Signal};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    constants::{
        DEFAULT_JANITOR_INTERVAL, DEFAULT_SHUTDOWN_GRACE, DEFAULT_STOP_SIGNAL, REGISTRY_FILE_NAME,
        RESTART_BACKOFF,
    },
    error::ControllerError,
    janitor::{Janitor, JanitorHandle, ReclaimLog},
    process::{ProcessEntry, ProcessTable, SystemProcesses},
    registry::{Entries, FileRegistry, Storage},
    watcher::{ExitCause, ExitRecord, StopLedger, TerminationEvent, Watcher},
};

/// Immutable settings for one Controller instance.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Binary name as configured.
    pub binary: String,
    /// Binary location, resolved once at construction.
    pub binary_path: PathBuf,
    /// Restart extensions that exit on their own.
    pub keep_alive: bool,
    /// Registry file location.
    pub registry_file: PathBuf,
    /// Interval between Janitor passes.
    pub janitor_interval: Duration,
    /// Signal delivered by Kill and Shutdown.
    pub stop_signal: Signal,
    /// Upper bound Shutdown waits for in-flight starts.
    pub shutdown_grace: Duration,
}

impl ControllerOptions {
    /// Resolves `binary` against `$PATH` and fills in defaults for everything else.
    pub fn new(binary: impl Into<String>) -> Result<Self, ControllerError> {
        let binary = binary.into();
        let binary_path =
            which::which(&binary).map_err(|source| ControllerError::BinaryNotFound {
                binary: binary.clone(),
                source,
            })?;

        Ok(Self {
            binary,
            binary_path,
            keep_alive: false,
            registry_file: std::env::temp_dir().join(REGISTRY_FILE_NAME),
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
            stop_signal: DEFAULT_STOP_SIGNAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Restart extensions that exit on their own.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Registry file location.
    pub fn with_registry_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_file = path.into();
        self
    }

    /// Interval between Janitor passes.
    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval;
        self
    }

    /// Signal delivered by Kill and Shutdown.
    pub fn with_stop_signal(mut self, signal: Signal) -> Self {
        self.stop_signal = signal;
        self
    }

    /// Upper bound Shutdown waits for in-flight starts.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Result of a successful [`Controller::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned.
    Started(u32),
    /// The registry already held a pid for the extension; nothing was spawned.
    AlreadyRunning(u32),
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::Started(pid) | StartOutcome::AlreadyRunning(pid) => *pid,
        }
    }
}

/// One row of a [`Controller::list`] result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedProcess {
    pub extension: String,
    pub pid: u32,
}

/// Counts operations that must finish before Shutdown enumerates the registry.
#[derive(Debug, Default)]
struct InFlight {
    state: Mutex<InFlightState>,
    drained: Condvar,
}

#[derive(Debug, Default)]
struct InFlightState {
    active: usize,
    closed: bool,
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
}

impl InFlight {
    fn enter(&self) -> Result<InFlightGuard<'_>, ControllerError> {
        let mut state = self.state.lock()?;
        if state.closed {
            return Err(ControllerError::ShuttingDown);
        }
        state.active += 1;
        Ok(InFlightGuard { in_flight: self })
    }

    /// Rejects new entries, then waits up to `timeout` for active ones to finish.
    /// Returns `false` if the timeout elapsed first.
    fn close_and_drain(&self, timeout: Duration) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed = true;

        let deadline = Instant::now() + timeout;
        while state.active > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = match self.drained.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .closed
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .in_flight
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.in_flight.drained.notify_all();
        }
    }
}

/// State shared between request handlers and the restart loop.
struct Inner {
    options: ControllerOptions,
    registry: Arc<dyn Storage>,
    processes: Arc<dyn ProcessTable>,
    watcher: Watcher,
    ledger: StopLedger,
    reclaimed: ReclaimLog,
    terminated: Mutex<Option<Sender<TerminationEvent>>>,
    in_flight: InFlight,
}

/// Supervises extension processes: start, kill, list, shutdown.
///
/// Construction starts exactly one Janitor loop and one restart-consumer loop;
/// both live as long as the Controller.
pub struct Controller {
    inner: Arc<Inner>,
    janitor: JanitorHandle,
    shut_down: AtomicBool,
}

impl Controller {
    /// Builds a Controller backed by the registry file in `options` and the OS process table.
    pub fn new(options: ControllerOptions) -> Result<Self, ControllerError> {
        let registry = Arc::new(FileRegistry::open(&options.registry_file)?);
        Ok(Self::with_parts(options, registry, Arc::new(SystemProcesses)))
    }

    /// Builds a Controller over explicit storage and process-table implementations.
    pub fn with_parts(
        options: ControllerOptions,
        registry: Arc<dyn Storage>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        let (terminated, events) = mpsc::channel();
        let ledger = StopLedger::default();
        let reclaimed = ReclaimLog::default();

        let mut janitor = Janitor::new(
            Arc::clone(&registry),
            processes.clone(),
            options.janitor_interval,
        );
        if options.keep_alive {
            janitor = janitor.with_reclaim_log(reclaimed.clone());
        }
        let janitor = janitor.spawn();

        let inner = Arc::new(Inner {
            watcher: Watcher::new(ledger.clone()),
            ledger,
            reclaimed,
            options,
            registry,
            processes,
            terminated: Mutex::new(Some(terminated)),
            in_flight: InFlight::default(),
        });

        let consumer = Arc::clone(&inner);
        thread::spawn(move || restart_loop(consumer, events));

        debug!(
            "Controller ready: binary {:?}, keep-alive {}",
            inner.options.binary_path, inner.options.keep_alive
        );

        Self {
            inner,
            janitor,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Starts `entry` unless the registry already holds a pid for its extension.
    ///
    /// The registry check, the spawn and the registry write form one critical section,
    /// so concurrent starts for the same extension spawn at most one process.
    pub fn start(&self, entry: ProcessEntry) -> Result<StartOutcome, ControllerError> {
        let _guard = self.inner.in_flight.enter()?;
        self.inner.start(entry)
    }

    /// Removes `extension` from the registry and signals its process.
    ///
    /// Does not wait for the process to die.
    pub fn kill(&self, extension: &str) -> Result<u32, ControllerError> {
        let pid = self
            .inner
            .registry
            .delete(extension)?
            .ok_or_else(|| ControllerError::NotFound(extension.to_string()))?;

        info!("Killing extension '{extension}' with pid {pid}...");
        self.inner.stop_pid(extension, pid)?;
        Ok(pid)
    }

    /// Snapshot of the registry sorted by extension name.
    ///
    /// An unreadable registry lists as empty.
    pub fn list(&self) -> Vec<ListedProcess> {
        let entries = self.inner.registry.load_all().unwrap_or_else(|err| {
            warn!("Failed to read registry for listing: {err}");
            Entries::new()
        });

        let mut listing: Vec<ListedProcess> = entries
            .into_iter()
            .map(|(extension, pid)| ListedProcess { extension, pid })
            .collect();
        listing.sort_by(|a, b| a.extension.cmp(&b.extension));
        listing
    }

    /// Most recent exit observed for `extension` by this Controller's watchers.
    pub fn last_exit(&self, extension: &str) -> Option<ExitRecord> {
        self.inner.watcher.last_exit(extension)
    }

    /// Returns `true` while the Janitor loop is running.
    pub fn janitor_running(&self) -> bool {
        self.janitor.is_running()
    }

    /// Stops every managed extension and clears the registry.
    ///
    /// New starts are refused from this point on. In-flight starts get up to the
    /// configured grace period to register before the registry is enumerated.
    /// Completion is published on `done` once per call.
    pub fn shutdown(&self, done: Sender<()>) -> Result<(), ControllerError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            let _ = done.send(());
            return Ok(());
        }

        if !self
            .inner
            .in_flight
            .close_and_drain(self.inner.options.shutdown_grace)
        {
            warn!(
                "In-flight starts did not finish within {:?}; shutting down anyway",
                self.inner.options.shutdown_grace
            );
        }

        self.janitor.stop();

        let mut drained = Entries::new();
        let result = self
            .inner
            .registry
            .transact(&mut |entries| {
                drained = std::mem::take(entries);
                true
            })
            .map_err(ControllerError::from);

        let mut targets: Vec<_> = drained.into_iter().collect();
        targets.sort();
        for (extension, pid) in targets {
            info!("Gracefully shutting down extension '{extension}' with pid [{pid}]...");
            if let Err(err) = self.inner.stop_pid(&extension, pid) {
                warn!("{err}");
            }
        }

        self.inner.close_events();
        let _ = done.send(());
        result
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.inner.in_flight.close_and_drain(Duration::ZERO);
        self.janitor.stop();
        self.inner.close_events();
    }
}

impl Inner {
    fn start(&self, mut entry: ProcessEntry) -> Result<StartOutcome, ControllerError> {
        let outcome = self.register(&mut entry)?;
        match outcome {
            StartOutcome::Started(pid) => {
                info!("Extension '{}' started with pid {pid}", entry.extension);
                self.follow(entry);
            }
            StartOutcome::AlreadyRunning(pid) => {
                debug!(
                    "Extension '{}' already running with pid {pid}",
                    entry.extension
                );
            }
        }
        Ok(outcome)
    }

    /// Checks the registry, spawns and records the new pid under one exclusive lock.
    fn register(&self, entry: &mut ProcessEntry) -> Result<StartOutcome, ControllerError> {
        let mut outcome = None;
        let mut failure = None;

        let committed = self.registry.transact(&mut |entries| {
            if let Some(&pid) = entries.get(&entry.extension)
                && pid != 0
            {
                outcome = Some(StartOutcome::AlreadyRunning(pid));
                return false;
            }

            match entry.spawn(&self.options.binary_path) {
                Ok(pid) => {
                    // Cleared before the entry becomes visible to Kill.
                    self.ledger.forget(pid);
                    entries.insert(entry.extension.clone(), pid);
                    outcome = Some(StartOutcome::Started(pid));
                    true
                }
                Err(err) => {
                    failure = Some(err);
                    false
                }
            }
        });

        if let Some(err) = failure {
            error!("{err}");
            return Err(err);
        }

        if let Err(err) = committed {
            if entry.pid != 0 {
                error!(
                    "Failed to register extension '{}' [{}]; stopping it: {err}",
                    entry.extension, entry.pid
                );
                self.abandon(entry.clone());
            }
            return Err(err.into());
        }

        outcome.ok_or_else(|| ControllerError::NotFound(entry.extension.clone()))
    }

    /// Respawns an extension that exited on its own.
    ///
    /// Spawns only while the registry still maps the extension to the dead pid, or
    /// when the Janitor reclaimed that exact entry. An entry that is gone for any
    /// other reason was removed by Kill or Shutdown and stays gone.
    fn restart(&self, event: TerminationEvent) -> Result<Option<u32>, ControllerError> {
        let _guard = self.in_flight.enter()?;
        let previous = event.entry.pid;
        let mut entry = event.entry;
        entry.pid = 0;

        let mut spawned = None;
        let mut failure = None;
        self.registry.transact(&mut |entries| {
            match entries.get(&entry.extension) {
                Some(&current) if current == previous => {}
                Some(_) => return false,
                None if self.reclaimed.take(&entry.extension, previous) => {}
                None => return false,
            }

            match entry.spawn(&self.options.binary_path) {
                Ok(pid) => {
                    self.ledger.forget(pid);
                    entries.insert(entry.extension.clone(), pid);
                    spawned = Some(pid);
                    true
                }
                Err(err) => {
                    entries.remove(&entry.extension);
                    failure = Some(err);
                    true
                }
            }
        })?;

        if let Some(err) = failure {
            return Err(err);
        }

        if spawned.is_some() {
            self.follow(entry);
        }
        Ok(spawned)
    }

    fn follow(&self, entry: ProcessEntry) {
        let terminated = self
            .terminated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| mpsc::channel().0);
        self.watcher
            .follow(entry, terminated, self.options.keep_alive);
    }

    /// Signals a process spawned but never registered and lets a watcher reap it.
    fn abandon(&self, entry: ProcessEntry) {
        self.ledger.mark(entry.pid);
        if let Err(err) = self.processes.signal(entry.pid, self.options.stop_signal) {
            warn!(
                "Failed to stop unregistered extension '{}' [{}]: {err}",
                entry.extension, entry.pid
            );
        }
        self.watcher.follow(entry, mpsc::channel().0, false);
    }

    /// Delivers the stop signal to `pid`, tagging its exit as deliberate.
    fn stop_pid(&self, extension: &str, pid: u32) -> Result<(), ControllerError> {
        self.ledger.mark(pid);
        match self.processes.signal(pid, self.options.stop_signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                self.ledger.forget(pid);
                warn!("Extension '{extension}' (pid {pid}) was no longer running");
                Ok(())
            }
            Err(source) => {
                self.ledger.forget(pid);
                Err(ControllerError::Signal {
                    extension: extension.to_string(),
                    pid,
                    source,
                })
            }
        }
    }

    fn close_events(&self) {
        self.terminated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Consumes termination events and restarts extensions that died on their own.
///
/// Restarts of the same extension are spaced at least [`RESTART_BACKOFF`] apart.
fn restart_loop(inner: Arc<Inner>, events: Receiver<TerminationEvent>) {
    let mut last_restart: HashMap<String, Instant> = HashMap::new();

    for event in events {
        let extension = event.entry.extension.clone();

        if !inner.options.keep_alive {
            continue;
        }

        match event.cause {
            ExitCause::Stopped => {
                inner.reclaimed.take(&extension, event.entry.pid);
                info!("Extension '{extension}' was stopped deliberately. Skipping restart.");
            }
            ExitCause::Exited if inner.in_flight.is_closed() => {
                debug!("Controller closing; not restarting '{extension}'");
            }
            ExitCause::Exited => {
                if let Some(previous) = last_restart.get(&extension) {
                    let wait = RESTART_BACKOFF.saturating_sub(previous.elapsed());
                    if !wait.is_zero() {
                        warn!("Extension '{extension}' is exiting rapidly; delaying restart by {wait:?}");
                        thread::sleep(wait);
                    }
                }
                last_restart.insert(extension.clone(), Instant::now());

                warn!("Extension '{extension}' exited. Restarting...");
                match inner.restart(event) {
                    Ok(Some(pid)) => info!("Extension '{extension}' restarted with pid {pid}"),
                    Ok(None) => {
                        info!("Extension '{extension}' was removed or replaced; not restarting")
                    }
                    Err(ControllerError::ShuttingDown) => {
                        debug!("Controller closing; not restarting '{extension}'")
                    }
                    Err(err) => error!("Failed to restart extension '{extension}': {err}"),
                }
            }
        }
    }
    debug!("Restart loop terminating.");
}
