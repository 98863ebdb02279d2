#[path = "common/mod.rs"]
mod common;

use std::{
    process::Command,
    sync::{Arc, mpsc},
    thread,
};

use common::{
    JANITOR_INTERVAL, sleep_options, wait_for_entry_removed, wait_for_process_exit,
};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use pman::{
    controller::Controller,
    janitor::Janitor,
    process::{ProcessEntry, SystemProcesses},
    registry::{FileRegistry, Storage},
};
use tempfile::tempdir;

fn shut_down(controller: &Controller) {
    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed.recv().unwrap();
}

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn externally_killed_extension_is_reclaimed() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry_file = options.registry_file.clone();
    let controller = Controller::new(options).unwrap();
    assert!(controller.janitor_running());

    let pid = controller
        .start(ProcessEntry::new("search", ["30"]))
        .unwrap()
        .pid();
    assert_eq!(controller.list().len(), 1);

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    wait_for_process_exit(pid);

    let registry = FileRegistry::open(&registry_file).unwrap();
    wait_for_entry_removed(&registry, "search");
    assert!(controller.list().is_empty());

    shut_down(&controller);
}

#[test]
fn stale_entries_from_a_previous_run_are_swept() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry = FileRegistry::open(&options.registry_file).unwrap();

    let stale = dead_pid();
    let live = std::process::id();
    let mut entry = ProcessEntry::new("stale", ["stale"]);
    entry.pid = stale;
    registry.store(&entry).unwrap();
    let mut entry = ProcessEntry::new("live", ["live"]);
    entry.pid = live;
    registry.store(&entry).unwrap();

    let controller = Controller::new(options).unwrap();
    wait_for_entry_removed(&registry, "stale");

    // A few more passes must leave the live entry alone.
    thread::sleep(JANITOR_INTERVAL * 3);
    assert_eq!(registry.load("live").unwrap(), Some(live));

    // Keep the test process out of the shutdown sweep.
    registry.delete("live").unwrap();
    shut_down(&controller);
}

#[test]
fn sweep_reports_what_it_removed() {
    let temp = tempdir().unwrap();
    let registry = Arc::new(FileRegistry::open(temp.path().join("registry.json")).unwrap());

    let stale = dead_pid();
    let mut entry = ProcessEntry::new("stale", ["stale"]);
    entry.pid = stale;
    registry.store(&entry).unwrap();

    let janitor = Janitor::new(
        registry.clone(),
        Arc::new(SystemProcesses),
        JANITOR_INTERVAL,
    );
    assert_eq!(janitor.sweep().unwrap(), vec![("stale".to_string(), stale)]);
    assert!(janitor.sweep().unwrap().is_empty());
    assert!(registry.load_all().unwrap().is_empty());
}

#[test]
fn shutdown_stops_the_janitor_loop() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();
    assert!(controller.janitor_running());

    shut_down(&controller);
    assert!(!controller.janitor_running());
}
