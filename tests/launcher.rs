//! End-to-end launcher tests. Like the teacher's `tests/container.rs`, these exercise real
//! namespace/mount syscalls and need `newuidmap`/`newgidmap` (or `/etc/subuid` entries) to
//! be usable unprivileged; they're written to run the same way the teacher's integration
//! suite does, not gated behind a feature flag.

mod common;

use common::TempDir;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use podder::{launcher, Layer};

fn run_in_child(layer: &Layer) -> WaitStatus {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // `start` only returns on failure: success ends in `execvpe`.
            let err = launcher::start(layer).unwrap_err();
            eprintln!("start failed: {err}");
            std::process::exit(1);
        }
        ForkResult::Parent { child } => waitpid(child, None).unwrap(),
    }
}

#[test]
fn start_runs_command_to_completion() {
    let tmp = TempDir::new().unwrap();
    let mut rootfs = common::get_rootfs().unwrap();

    let mut layer = Layer::open(tmp.as_path(), "box", None).unwrap();
    layer.write().unwrap();
    rootfs.unpack(tmp.join("box/root")).unwrap();
    layer.set_cmd(&["/bin/true".to_string()]);
    layer.write().unwrap();

    let status = run_in_child(&layer);
    assert_eq!(status, WaitStatus::Exited(status.pid().unwrap(), 0));
    assert!(!layer.pidfile().exists());
}

#[test]
fn start_rejects_missing_layer() {
    let tmp = TempDir::new().unwrap();
    let layer = Layer::open(tmp.as_path(), "does-not-exist", None).unwrap();
    let err = launcher::start(&layer).unwrap_err();
    assert!(matches!(err, podder::Error::NotFound(_)));
}

#[test]
fn exec_rejects_layer_without_pidfile() {
    let tmp = TempDir::new().unwrap();
    let layer = Layer::open(tmp.as_path(), "idle", None).unwrap();
    layer.write().unwrap();
    let err = launcher::exec(&layer, vec!["/bin/true".to_string()]).unwrap_err();
    assert!(matches!(err, podder::Error::NotFound(_)));
}

#[test]
fn ephemeral_layer_upper_does_not_survive_a_run() {
    let tmp = TempDir::new().unwrap();
    let mut rootfs = common::get_rootfs().unwrap();

    let mut layer = Layer::open(tmp.as_path(), "scratch", None).unwrap();
    layer.set_ephemeral(true);
    layer.write().unwrap();
    rootfs.unpack(tmp.join("scratch/root")).unwrap();
    layer.set_cmd(&[
        "/bin/sh".to_string(),
        "-c".to_string(),
        "touch /left-behind".to_string(),
    ]);
    layer.write().unwrap();

    let status = run_in_child(&layer);
    assert_eq!(status, WaitStatus::Exited(status.pid().unwrap(), 0));
    // The tmpfs upper is gone with the process; the on-disk root/ is untouched.
    assert!(!tmp.join("scratch/root/left-behind").exists());
}
