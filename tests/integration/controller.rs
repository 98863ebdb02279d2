#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    sync::{Arc, Barrier, mpsc},
    thread,
    time::{Duration, Instant},
};

use common::{is_process_alive, sleep_options, wait_for_entry_removed, wait_for_process_exit};
use pman::{
    controller::{Controller, ControllerOptions, StartOutcome},
    error::ControllerError,
    process::ProcessEntry,
    registry::{FileRegistry, Storage},
};
use tempfile::tempdir;

fn nap(extension: &str) -> ProcessEntry {
    ProcessEntry::new(extension, ["30"])
}

fn shut_down(controller: &Controller) {
    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed.recv().unwrap();
}

#[test]
fn start_registers_a_live_process() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry_file = options.registry_file.clone();
    let controller = Controller::new(options).unwrap();

    let outcome = controller.start(nap("search")).unwrap();
    let pid = match outcome {
        StartOutcome::Started(pid) => pid,
        other => panic!("expected a fresh spawn, got {other:?}"),
    };

    assert!(is_process_alive(pid));
    let registry = FileRegistry::open(&registry_file).unwrap();
    assert_eq!(registry.load("search").unwrap(), Some(pid));

    shut_down(&controller);
}

#[test]
fn second_start_reports_existing_pid() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();

    let first = controller.start(nap("search")).unwrap();
    let second = controller.start(nap("search")).unwrap();

    assert!(matches!(first, StartOutcome::Started(_)));
    assert_eq!(second, StartOutcome::AlreadyRunning(first.pid()));
    assert_eq!(controller.list().len(), 1);

    shut_down(&controller);
}

#[test]
fn concurrent_starts_spawn_exactly_once() {
    let temp = tempdir().unwrap();
    let controller = Arc::new(Controller::new(sleep_options(temp.path())).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let controller = Arc::clone(&controller);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                controller.start(nap("search")).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<StartOutcome> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let spawned = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, StartOutcome::Started(_)))
        .count();

    assert_eq!(spawned, 1);
    let pid = outcomes[0].pid();
    assert!(outcomes.iter().all(|outcome| outcome.pid() == pid));

    shut_down(&controller);
}

#[test]
fn kill_removes_entry_and_stops_process() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();

    let pid = controller.start(nap("search")).unwrap().pid();
    let other = controller.start(nap("proxy")).unwrap().pid();

    assert_eq!(controller.kill("search").unwrap(), pid);
    wait_for_process_exit(pid);

    let listing = controller.list();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].extension, "proxy");
    assert!(is_process_alive(other));

    shut_down(&controller);
}

#[test]
fn kill_of_unknown_extension_is_not_found() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();

    let err = controller.kill("ghost").unwrap_err();
    assert!(matches!(err, ControllerError::NotFound(ref name) if name == "ghost"));

    shut_down(&controller);
}

#[test]
fn list_is_sorted_by_extension() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();

    for name in ["search", "auth", "proxy"] {
        controller.start(nap(name)).unwrap();
    }

    let names: Vec<_> = controller
        .list()
        .into_iter()
        .map(|row| row.extension)
        .collect();
    assert_eq!(names, vec!["auth", "proxy", "search"]);

    shut_down(&controller);
}

#[test]
fn spawn_failure_leaves_registry_untouched() {
    let temp = tempdir().unwrap();
    let script = temp.path().join("runtime");
    fs::write(&script, "#!/bin/sh\nexec sleep \"$@\"\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let options = ControllerOptions::new(script.to_string_lossy().into_owned())
        .unwrap()
        .with_registry_file(temp.path().join("registry.json"));
    let registry_file = options.registry_file.clone();
    let controller = Controller::new(options).unwrap();

    // Resolved at construction, gone by the time of the spawn.
    fs::remove_file(&script).unwrap();

    let err = controller.start(nap("search")).unwrap_err();
    assert!(matches!(err, ControllerError::SpawnFailure { ref extension, .. } if extension == "search"));

    let registry = FileRegistry::open(&registry_file).unwrap();
    assert!(registry.load_all().unwrap().is_empty());

    shut_down(&controller);
}

#[test]
fn natural_exit_is_recorded_and_reclaimed() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry_file = options.registry_file.clone();
    let controller = Controller::new(options).unwrap();

    let pid = controller
        .start(ProcessEntry::new("bogus", ["not-a-number"]))
        .unwrap()
        .pid();
    wait_for_process_exit(pid);

    let registry = FileRegistry::open(&registry_file).unwrap();
    wait_for_entry_removed(&registry, "bogus");

    let deadline = Instant::now() + Duration::from_secs(5);
    let exit = loop {
        if let Some(exit) = controller.last_exit("bogus") {
            break exit;
        }
        assert!(Instant::now() < deadline, "exit of 'bogus' was never recorded");
        thread::sleep(Duration::from_millis(50));
    };
    assert_ne!(exit.code, Some(0));

    shut_down(&controller);
}

#[test]
fn unknown_binary_is_rejected_at_construction() {
    let err = ControllerOptions::new("pman-test-binary-that-does-not-exist").unwrap_err();
    assert!(matches!(err, ControllerError::BinaryNotFound { .. }));
}
