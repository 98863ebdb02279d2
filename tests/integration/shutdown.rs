#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use common::{sleep_options, wait_for_process_exit};
use pman::{
    controller::Controller, error::ControllerError, process::ProcessEntry,
    registry::FileRegistry, registry::Storage,
};
use tempfile::tempdir;

#[test]
fn shutdown_kills_every_extension_and_clears_the_registry() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry_file = options.registry_file.clone();
    let controller = Controller::new(options).unwrap();

    let pids: Vec<u32> = ["search", "proxy", "auth"]
        .into_iter()
        .map(|name| {
            controller
                .start(ProcessEntry::new(name, ["30"]))
                .unwrap()
                .pid()
        })
        .collect();

    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed
        .recv_timeout(Duration::from_secs(5))
        .expect("shutdown never published completion");

    for pid in pids {
        wait_for_process_exit(pid);
    }
    assert_eq!(fs::read_to_string(&registry_file).unwrap().trim(), "{}");
    assert!(controller.list().is_empty());
}

#[test]
fn starts_after_shutdown_are_refused() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();

    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed.recv().unwrap();

    let err = controller
        .start(ProcessEntry::new("late", ["30"]))
        .unwrap_err();
    assert!(matches!(err, ControllerError::ShuttingDown));
    assert!(controller.list().is_empty());
}

#[test]
fn repeated_shutdown_still_publishes_completion() {
    let temp = tempdir().unwrap();
    let controller = Controller::new(sleep_options(temp.path())).unwrap();

    for _ in 0..2 {
        let (done, completed) = mpsc::channel();
        controller.shutdown(done).unwrap();
        completed
            .recv_timeout(Duration::from_secs(5))
            .expect("shutdown never published completion");
    }
}

#[test]
fn shutdown_tolerates_entries_whose_process_is_gone() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry = FileRegistry::open(&options.registry_file).unwrap();

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let mut entry = ProcessEntry::new("gone", ["gone"]);
    entry.pid = child.id();
    child.wait().unwrap();
    registry.store(&entry).unwrap();

    // A long interval keeps the Janitor from reclaiming the entry first.
    let controller =
        Controller::new(options.with_janitor_interval(Duration::from_secs(60))).unwrap();

    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed.recv().unwrap();

    assert!(registry.load_all().unwrap().is_empty());
}

#[test]
fn starts_racing_shutdown_are_either_registered_then_stopped_or_refused() {
    let temp = tempdir().unwrap();
    let options = sleep_options(temp.path());
    let registry_file = options.registry_file.clone();
    let controller = Arc::new(Controller::new(options).unwrap());

    let starters: Vec<_> = (0..6)
        .map(|i| {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.start(ProcessEntry::new(format!("ext-{i}"), ["30"])))
        })
        .collect();

    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed.recv().unwrap();

    for starter in starters {
        match starter.join().unwrap() {
            Ok(outcome) => wait_for_process_exit(outcome.pid()),
            Err(err) => assert!(matches!(err, ControllerError::ShuttingDown)),
        }
    }

    assert_eq!(fs::read_to_string(&registry_file).unwrap().trim(), "{}");
}
