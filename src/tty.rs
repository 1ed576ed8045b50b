//! Forks the process that becomes PID 1 inside the new namespaces and, when attached to a
//! terminal, brokers a PTY between that child and our own stdio until it exits.
//!
//! The parent branch of [`fork_pid1`] never returns: it supervises the child, restores the
//! terminal, removes the pid file, and calls `process::exit` with the child's translated
//! exit status. Only the child branch returns control to the caller.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::fcntl::{openat, OFlag};
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{isatty, read, unlinkat, write as nix_write, ForkResult, Pid, UnlinkatFlags};

use crate::error::Error;

nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, nix::libc::TIOCSWINSZ, Winsize);

static WINCH: AtomicBool = AtomicBool::new(false);
static TERM: AtomicBool = AtomicBool::new(false);
static FORWARD_TO: AtomicI32 = AtomicI32::new(0);

extern "C" fn on_winch(_: i32) {
    WINCH.store(true, Ordering::SeqCst);
}

extern "C" fn on_term(_: i32) {
    TERM.store(true, Ordering::SeqCst);
}

fn install_handlers(child: Pid) -> Result<(), Error> {
    FORWARD_TO.store(child.as_raw(), Ordering::SeqCst);
    unsafe {
        sigaction(
            Signal::SIGTERM,
            &SigAction::new(SigHandler::Handler(on_term), SaFlags::empty(), SigSet::empty()),
        )?;
        sigaction(
            Signal::SIGWINCH,
            &SigAction::new(SigHandler::Handler(on_winch), SaFlags::empty(), SigSet::empty()),
        )?;
    }
    Ok(())
}

/// What the caller should do after `fork_pid1` returns: only `Child` is ever observed,
/// since the parent branch exits the process itself.
pub enum ForkOutcome {
    Child,
}

fn write_pidfile(dir_fd: Option<&OwnedFd>, name: &str, pid: Pid) -> Result<(), Error> {
    let Some(dir_fd) = dir_fd else { return Ok(()) };
    let fd = openat(
        dir_fd.as_raw_fd(),
        name,
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
        Mode::from_bits_truncate(0o644),
    )?;
    let mut f = unsafe { std::fs::File::from_raw_fd(fd) };
    f.write_all(format!("{}\n", pid.as_raw()).as_bytes())?;
    Ok(())
}

fn remove_pidfile(dir_fd: Option<&OwnedFd>, name: &str) {
    if let Some(dir_fd) = dir_fd {
        let _ = unlinkat(Some(dir_fd.as_raw_fd()), name, UnlinkatFlags::NoRemoveDir);
    }
}

fn exit_code_for(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => 1,
    }
}

/// Forks and, in the parent, supervises the child until it exits; in the child, returns
/// immediately so the caller can continue becoming PID 1.
///
/// `pidfile` is `(directory fd, file name)`, resolved with `openat` so it keeps working
/// after the caller later calls `pivot_root`.
pub fn fork_pid1(pidfile: Option<(&OwnedFd, &str)>) -> Result<ForkOutcome, Error> {
    let stdin_is_tty = isatty(0).unwrap_or(false);
    if stdin_is_tty {
        let original: Termios = tcgetattr(std::io::stdin())?;
        match unsafe { forkpty(None, None) }? {
            ForkptyResult {
                fork_result: ForkResult::Child,
                ..
            } => Ok(ForkOutcome::Child),
            ForkptyResult {
                master,
                fork_result: ForkResult::Parent { child },
            } => supervise_tty(child, master, original, pidfile),
        }
    } else {
        match unsafe { nix::unistd::fork() }? {
            ForkResult::Child => Ok(ForkOutcome::Child),
            ForkResult::Parent { child } => supervise_plain(child, pidfile),
        }
    }
}

fn supervise_plain(child: Pid, pidfile: Option<(&OwnedFd, &str)>) -> ! {
    let (dir_fd, name) = match pidfile {
        Some((d, n)) => (Some(d), n),
        None => (None, ""),
    };
    let _ = write_pidfile(dir_fd, name, child);
    let _ = install_handlers(child);

    let code = loop {
        match waitpid(child, None) {
            Ok(status) => break exit_code_for(status),
            Err(nix::errno::Errno::EINTR) => {
                if TERM.swap(false, Ordering::SeqCst) {
                    let _ = nix::sys::signal::kill(child, Signal::SIGTERM);
                }
                continue;
            }
            Err(_) => break 1,
        }
    };
    remove_pidfile(dir_fd, name);
    std::process::exit(code);
}

fn supervise_tty(
    child: Pid,
    master: OwnedFd,
    original: Termios,
    pidfile: Option<(&OwnedFd, &str)>,
) -> ! {
    let (dir_fd, name) = match pidfile {
        Some((d, n)) => (Some(d), n),
        None => (None, ""),
    };
    let _ = write_pidfile(dir_fd, name, child);
    let _ = install_handlers(child);

    let mut raw = original.clone();
    cfmakeraw(&mut raw);
    let _ = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw);

    // Prime the child's window size immediately, matching a real shell's first SIGWINCH.
    WINCH.store(true, Ordering::SeqCst);

    let stdin_fd = 0;
    let stdout_fd = 1;
    let mut pending_stdin: Vec<u8> = Vec::new();
    let mut pending_stdout: Vec<u8> = Vec::new();
    let mut stdin_open = true;
    let mut master: Option<OwnedFd> = Some(master);

    let code = 'relay: loop {
        let Some(master_fd) = master.as_ref().map(|m| m.as_raw_fd()) else {
            break 'relay match waitpid(child, None) {
                Ok(status) => exit_code_for(status),
                Err(_) => 1,
            };
        };

        if WINCH.swap(false, Ordering::SeqCst) {
            let mut ws = Winsize {
                ws_row: 0,
                ws_col: 0,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            if unsafe { tiocgwinsz(stdin_fd, &mut ws) }.is_ok() {
                let _ = unsafe { tiocswinsz(master_fd, &ws) };
            }
        }
        if TERM.swap(false, Ordering::SeqCst) {
            let _ = nix::sys::signal::kill(child, Signal::SIGTERM);
        }

        let mut rfds = FdSet::new();
        let mut wfds = FdSet::new();
        if !pending_stdin.is_empty() {
            wfds.insert(master_fd);
        } else if stdin_open {
            rfds.insert(stdin_fd);
        }
        if !pending_stdout.is_empty() {
            wfds.insert(stdout_fd);
        } else {
            rfds.insert(master_fd);
        }

        match select(None, Some(&mut rfds), Some(&mut wfds), None, None) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break 1,
        }

        if rfds.contains(stdin_fd) {
            let mut buf = [0u8; 1024];
            match read(stdin_fd, &mut buf) {
                Ok(0) | Err(_) => {
                    // Matches the handshake's "closure of host stdin closes the master":
                    // dropping our end of the pty lets the child observe EOF/IO error on
                    // its side, which the next loop iteration turns into a clean exit.
                    stdin_open = false;
                    master = None;
                }
                Ok(n) => pending_stdin.extend_from_slice(&buf[..n]),
            }
        }
        if master.is_some() && rfds.contains(master_fd) {
            let mut buf = [0u8; 1024];
            match read(master_fd, &mut buf) {
                Ok(0) | Err(_) => break 'relay match waitpid(child, None) {
                    Ok(status) => exit_code_for(status),
                    Err(_) => 1,
                },
                Ok(n) => pending_stdout.extend_from_slice(&buf[..n]),
            }
        }
        if wfds.contains(stdout_fd) && !pending_stdout.is_empty() {
            if let Ok(n) = nix_write(std::io::stdout(), &pending_stdout) {
                pending_stdout.drain(..n);
            }
        }
        if let Some(master_ref) = master.as_ref() {
            if wfds.contains(master_fd) && !pending_stdin.is_empty() {
                if let Ok(n) = nix_write(master_ref, &pending_stdin) {
                    pending_stdin.drain(..n);
                }
            }
        }
    };

    unsafe {
        let _ = sigaction(
            Signal::SIGTTOU,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        );
    }
    let _ = tcsetattr(std::io::stdin(), SetArg::TCSADRAIN, &original);
    remove_pidfile(dir_fd, name);
    std::process::exit(code);
}
