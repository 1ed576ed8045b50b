//! Drives a [`Layer`] through the full start sequence: double-fork/eventfd uid-gid
//! handshake, namespace unshare, overlay mount, pivot_root, device population, the PID-1
//! fork (with optional PTY broker), and finally `execvpe` into the layer's command.
//!
//! The sequence is modeled as a state machine purely for logging clarity — each function
//! below corresponds to one `LaunchState` transition, named in its doc comment, though the
//! states themselves are never matched on at runtime.
use std::ffi::CString;

use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvpe, fork, getppid, ForkResult, Pid};

use crate::error::Error;
use crate::layer::Layer;
use crate::notify::Notifier;
use crate::{mounts, syscall, tty, userns};

/// Named for logging only; see the module doc comment.
#[derive(Debug)]
#[allow(dead_code)]
enum LaunchState {
    Start,
    Unshared,
    Mapped,
    Mounted,
    Pivoted,
    DevicesPopulated,
    Executed,
}

fn log_state(state: LaunchState) {
    log::debug!("launch: entering {state:?}");
}

fn has_running_pidfile(layer: &Layer) -> Result<Option<i32>, Error> {
    let pidfile = layer.pidfile();
    if !pidfile.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&pidfile)?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|_| Error::ConfigParse(format!("corrupt pid file {pidfile:?}")))?;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Ok(Some(pid)),
        Err(_) => {
            log::warn!("stale pid file {pidfile:?} for missing pid {pid}; removing");
            std::fs::remove_file(&pidfile)?;
            Ok(None)
        }
    }
}

/// Starts `layer`. Only returns on failure: success ends in `execvpe`, which replaces this
/// process image.
pub fn start(layer: &Layer) -> Result<(), Error> {
    log_state(LaunchState::Start);
    if !layer.path.exists() {
        return Err(Error::NotFound(layer.path.display().to_string()));
    }
    if let Some(pid) = has_running_pidfile(layer)? {
        return Err(Error::AlreadyRunning(pid));
    }

    let networked = layer.ifname().is_some();
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWCGROUP
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWPID;
    if networked {
        flags |= CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS;
    }

    let mut event = syscall::eventfd(0).map_err(|source| Error::Syscall { call: "eventfd", source })?;

    match unsafe { fork() }? {
        ForkResult::Child => {
            // Wait for the parent to unshare before mapping its (now separate) user
            // namespace.
            let _ = syscall::eventfd_read(&mut event);
            let _ = userns::map_current_user(getppid());
            unsafe { nix::libc::_exit(0) };
        }
        ForkResult::Parent { child } => {
            unshare(flags)?;
            log_state(LaunchState::Unshared);
            syscall::eventfd_write(&mut event, 1)?;
            match waitpid(child, None)? {
                WaitStatus::Exited(_, 0) => {}
                other => return Err(Error::ChildCrashed(format!("{other:?}"))),
            }
            log_state(LaunchState::Mapped);
        }
    }

    mounts::make_root_private()?;

    // Keep a handle to the layer directory so the pid file can still be written by path
    // after `pivot_root` moves the mount namespace out from under us.
    let dir_fd = mounts::open_dir_handle(&layer.path)?;

    let mut overlay = layer.overlay();
    let run_dir = layer.path.join("run");
    let mut workdir = layer.path.join("run");
    let userxattr = if layer.ephemeral() {
        let (work, upper) = mounts::mount_ephemeral_upper(&run_dir)?;
        workdir = work;
        overlay.insert(0, upper);
        false
    } else {
        true
    };

    let merged = layer.path.join("merged");
    mounts::mount_overlay(&overlay, &merged, &workdir, userxattr)?;

    if networked {
        mounts::bind_network_files(&merged)?;
    }
    log_state(LaunchState::Mounted);

    mounts::pivot(&merged)?;
    log_state(LaunchState::Pivoted);

    populate_and_run(layer, dir_fd)?;
    unreachable!("populate_and_run only returns via execvpe or an error");
}

/// Runs everything between `pivot_root` and `execve`: device population, the PID-1 fork,
/// `/proc`+`/sys`, then — regardless of whether that block succeeded — detaches and
/// removes `/old_root` and closes `dir_fd` before handing control to `exec_layer`, matching
/// `original_source/podder/layer.py`'s nested `try`/`finally` around the same span.
fn populate_and_run(layer: &Layer, dir_fd: std::os::fd::OwnedFd) -> Result<(), Error> {
    let result = populate_dev_and_mount_pid1(&dir_fd);
    let cleanup = mounts::cleanup_old_root();
    // Closes the host-side layer directory fd: it must not survive into the container's
    // entrypoint, which inherits every fd still open across `execve`.
    drop(dir_fd);
    result?;
    cleanup?;

    let notifier = Notifier::from_env()?;
    notifier.ready()?;

    exec_layer(layer)
}

fn populate_dev_and_mount_pid1(dir_fd: &std::os::fd::OwnedFd) -> Result<(), Error> {
    mounts::populate_dev_tmpfs()?;
    mounts::mount_dev_shm()?;
    for node in ["null", "zero", "full", "random", "urandom", "tty"] {
        mounts::bind_dev_node(node)?;
    }
    mounts::mount_dev_mqueue()?;
    mounts::mount_devpts()?;
    log_state(LaunchState::DevicesPopulated);

    let stdin_is_tty = nix::unistd::isatty(0).unwrap_or(false);

    match tty::fork_pid1(Some((dir_fd, "init.pid")))? {
        tty::ForkOutcome::Child => {}
    }

    // We are now PID 1. Mount /proc first: the pty slave's path (needed for the console
    // bind below) is only resolvable through /proc/self/fd once we've pivoted.
    mounts::mount_proc()?;

    if stdin_is_tty {
        let target = std::fs::read_link("/proc/self/fd/0")?;
        mounts::bind_console(&target)?;
    }

    mounts::mount_sys()?;

    Ok(())
}

fn exec_layer(layer: &Layer) -> Result<(), Error> {
    let cmd = layer.cmd();
    let program = cmd
        .first()
        .ok_or_else(|| Error::ConfigParse("layer has no cmd configured".into()))?;
    let args: Vec<CString> = cmd
        .iter()
        .map(|s| CString::new(s.as_str()).map_err(|_| Error::ConfigParse(format!("invalid argv entry {s:?}"))))
        .collect::<Result<_, _>>()?;
    let env: Vec<CString> = layer
        .env()
        .iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}")).map_err(|_| Error::ConfigParse(format!("invalid env entry {k:?}")))
        })
        .collect::<Result<_, _>>()?;
    let program = CString::new(program.as_str())
        .map_err(|_| Error::ConfigParse(format!("invalid argv entry {program:?}")))?;
    log_state(LaunchState::Executed);
    execvpe(&program, &args, &env)?;
    unreachable!("execvpe only returns on error, which is propagated by `?` above")
}

/// Joins a running layer's namespaces (via its pid file) and execs `cmd` inside them,
/// inheriting the layer's effective environment.
pub fn exec(layer: &Layer, cmd: Vec<String>) -> Result<(), Error> {
    if !layer.path.exists() {
        return Err(Error::NotFound(layer.path.display().to_string()));
    }
    let pidfile = layer.pidfile();
    if !pidfile.exists() {
        return Err(Error::NotFound(pidfile.display().to_string()));
    }
    let pid: i32 = std::fs::read_to_string(&pidfile)?
        .trim()
        .parse()
        .map_err(|_| Error::ConfigParse(format!("corrupt pid file {pidfile:?}")))?;

    let pid_fd = syscall::pidfd_open(Pid::from_raw(pid)).map_err(|source| Error::Syscall {
        call: "pidfd_open",
        source,
    })?;
    let flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWCGROUP
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWUTS;
    nix::sched::setns(&pid_fd, flags)?;

    match tty::fork_pid1(None)? {
        tty::ForkOutcome::Child => {}
    }

    let program = cmd
        .first()
        .ok_or_else(|| Error::ConfigParse("no command given to exec".into()))?;
    let args: Vec<CString> = cmd
        .iter()
        .map(|s| CString::new(s.as_str()).map_err(|_| Error::ConfigParse(format!("invalid argv entry {s:?}"))))
        .collect::<Result<_, _>>()?;
    let env: Vec<CString> = layer
        .env()
        .iter()
        .map(|(k, v)| {
            CString::new(format!("{k}={v}")).map_err(|_| Error::ConfigParse(format!("invalid env entry {k:?}")))
        })
        .collect::<Result<_, _>>()?;
    let program = CString::new(program.as_str())
        .map_err(|_| Error::ConfigParse(format!("invalid argv entry {program:?}")))?;
    execvpe(&program, &args, &env)?;
    unreachable!("execvpe only returns on error, which is propagated by `?` above")
}
