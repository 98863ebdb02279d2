#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::mpsc, thread, time::Duration};

use common::{
    JANITOR_INTERVAL, is_process_alive, sleep_options, wait_for_entry, wait_for_new_pid,
    wait_for_process_exit,
};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use pman::{
    controller::{Controller, ControllerOptions},
    process::ProcessEntry,
    registry::{FileRegistry, Storage},
};
use tempfile::tempdir;

fn keep_alive_controller(dir: &std::path::Path) -> (Controller, FileRegistry) {
    let options = sleep_options(dir).with_keep_alive(true);
    let registry = FileRegistry::open(&options.registry_file).unwrap();
    (Controller::new(options).unwrap(), registry)
}

fn shut_down(controller: &Controller) {
    let (done, completed) = mpsc::channel();
    controller.shutdown(done).unwrap();
    completed.recv().unwrap();
}

#[test]
fn extension_that_exits_is_restarted_with_a_new_pid() {
    let temp = tempdir().unwrap();
    let (controller, registry) = keep_alive_controller(temp.path());

    let first = controller
        .start(ProcessEntry::new("blip", ["1"]))
        .unwrap()
        .pid();

    let second = wait_for_new_pid(&registry, "blip", first);
    assert_ne!(first, second);
    assert_eq!(controller.last_exit("blip").unwrap().code, Some(0));
    assert_eq!(controller.list().len(), 1);

    shut_down(&controller);
}

#[test]
fn externally_killed_extension_is_restarted() {
    let temp = tempdir().unwrap();
    let (controller, registry) = keep_alive_controller(temp.path());

    let first = controller
        .start(ProcessEntry::new("search", ["30"]))
        .unwrap()
        .pid();
    kill(Pid::from_raw(first as i32), Signal::SIGKILL).unwrap();

    let second = wait_for_new_pid(&registry, "search", first);
    assert!(is_process_alive(second));
    assert_eq!(
        controller.last_exit("search").unwrap().signal,
        Some(Signal::SIGKILL as i32)
    );

    shut_down(&controller);
}

#[test]
fn killed_extension_is_not_resurrected() {
    let temp = tempdir().unwrap();
    let (controller, registry) = keep_alive_controller(temp.path());

    let pid = controller
        .start(ProcessEntry::new("search", ["30"]))
        .unwrap()
        .pid();
    controller.kill("search").unwrap();
    wait_for_process_exit(pid);

    thread::sleep(JANITOR_INTERVAL * 5);
    assert_eq!(registry.load("search").unwrap(), None);
    assert!(controller.list().is_empty());

    shut_down(&controller);
}

#[test]
fn restart_after_kill_and_start_keeps_one_process() {
    let temp = tempdir().unwrap();
    let (controller, registry) = keep_alive_controller(temp.path());

    let first = controller
        .start(ProcessEntry::new("search", ["30"]))
        .unwrap()
        .pid();
    controller.kill("search").unwrap();
    let second = controller
        .start(ProcessEntry::new("search", ["30"]))
        .unwrap()
        .pid();
    wait_for_process_exit(first);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(wait_for_entry(&registry, "search"), second);
    assert_eq!(controller.list().len(), 1);

    shut_down(&controller);
}

#[test]
fn shutdown_does_not_trigger_restarts() {
    let temp = tempdir().unwrap();
    let (controller, registry) = keep_alive_controller(temp.path());

    let pids: Vec<u32> = ["search", "proxy"]
        .into_iter()
        .map(|name| {
            controller
                .start(ProcessEntry::new(name, ["30"]))
                .unwrap()
                .pid()
        })
        .collect();

    shut_down(&controller);
    for pid in pids {
        wait_for_process_exit(pid);
    }

    thread::sleep(JANITOR_INTERVAL * 5);
    assert!(registry.load_all().unwrap().is_empty());
}

#[test]
fn crash_looping_extension_is_restarted_at_a_bounded_rate() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("launches.log");
    let options = ControllerOptions::new("sh")
        .unwrap()
        .with_registry_file(temp.path().join("registry.json"))
        .with_janitor_interval(JANITOR_INTERVAL)
        .with_keep_alive(true);
    let controller = Controller::new(options).unwrap();

    let script = format!("echo launched >> {}", log.display());
    controller
        .start(ProcessEntry::new("flap", ["-c", script.as_str()]))
        .unwrap();

    thread::sleep(Duration::from_millis(1500));
    shut_down(&controller);

    let launches = fs::read_to_string(&log).unwrap().lines().count();
    assert!(
        (2..=3).contains(&launches),
        "expected one immediate restart then one per second, saw {launches} launches"
    );
}
