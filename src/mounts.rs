//! Low-level mount and namespace-plumbing primitives used by the launcher: the overlay
//! chain, network bind mounts, pivot_root, and the `/dev` + `/proc` + `/sys` population
//! that happens once we are PID 1 in the new root.

use std::fs::{self, create_dir, create_dir_all, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::fchdir;

use crate::error::Error;

pub(crate) fn ignore_kind(result: std::io::Result<()>, kind: ErrorKind) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == kind => Ok(()),
        Err(err) => Err(err),
    }
}

/// Equivalent of `mount("ignored", "/", "ignored", MS_PRIVATE | MS_REC, NULL)`: ensures
/// further mount/unmount events inside this mount namespace do not propagate to the host.
pub fn make_root_private() -> Result<(), Error> {
    Ok(mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )?)
}

/// Sets up the ephemeral upper layer on a fresh tmpfs inside `run_dir`, returning
/// `(workdir, upperdir)`.
pub fn mount_ephemeral_upper(run_dir: &Path) -> Result<(PathBuf, PathBuf), Error> {
    mount(
        Some("none"),
        run_dir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("mode=777"),
    )?;
    let work = run_dir.join("work");
    let upper = run_dir.join("upper");
    create_dir(&work)?;
    create_dir(&upper)?;
    Ok((work, upper))
}

/// Mounts the overlay (or, for a single layer, a plain bind mount) at `merged`.
///
/// `dirs` is ordered top-first: `dirs[0]` is the upperdir (or the sole layer for a
/// single-layer bind), the rest are lowerdirs from nearest to furthest ancestor.
/// `userxattr` must be true unless `dirs[0]` sits on a tmpfs we mounted ourselves (tmpfs
/// does not support user extended attributes, but supports the regular kind).
pub fn mount_overlay(
    dirs: &[PathBuf],
    merged: &Path,
    workdir: &Path,
    userxattr: bool,
) -> Result<(), Error> {
    if dirs.len() > 1 {
        let lowerdir = dirs[1..]
            .iter()
            .map(|p| p.to_string_lossy())
            .collect::<Vec<_>>()
            .join(":");
        let data = format!(
            "lowerdir={lowerdir},upperdir={},workdir={},xino=off{}",
            dirs[0].display(),
            workdir.display(),
            if userxattr { ",userxattr" } else { "" }
        );
        Ok(mount(
            Some("none"),
            merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )?)
    } else {
        Ok(mount(
            Some(&dirs[0]),
            merged,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?)
    }
}

/// Bind-mounts `/etc/hosts`, `/etc/hostname` and `/etc/resolv.conf` from the host (with
/// symlinks resolved) into `merged`, creating empty placeholder files first.
pub fn bind_network_files(merged: &Path) -> Result<(), Error> {
    for what in ["/etc/hosts", "/etc/hostname", "/etc/resolv.conf"] {
        let target = merged.join(what.trim_start_matches('/'));
        OpenOptions::new().create(true).write(true).truncate(false).open(&target)?;
        let source = fs::canonicalize(what)?;
        mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)?;
    }
    Ok(())
}

/// Moves the mounted-on-`merged` filesystem to become `/`, with the previous root parked
/// at `/old_root`. Must be called with `merged` as the current working directory's
/// ancestor; changes the working directory to the new `/` as a side effect.
pub fn pivot(merged: &Path) -> Result<(), Error> {
    let old_root = merged.join("old_root");
    ignore_kind(create_dir(&old_root), ErrorKind::AlreadyExists)?;
    nix::unistd::pivot_root(merged, &old_root)?;
    nix::unistd::chdir("/")?;
    Ok(())
}

/// Detaches `/old_root` and removes the now-empty mountpoint. Must run after all bind
/// mounts that reach through `/old_root/...` (device nodes, `/sys` fallback) are done.
pub fn cleanup_old_root() -> Result<(), Error> {
    umount2("/old_root", MntFlags::MNT_DETACH)?;
    fs::remove_dir("/old_root")?;
    Ok(())
}

/// Mounts a fresh `tmpfs` at `/dev` and creates the `/proc/self/fd` shortcut symlinks.
pub fn populate_dev_tmpfs() -> Result<(), Error> {
    mount(
        Some("none"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=755"),
    )?;
    for (link, target) in [
        ("/dev/fd", "/proc/self/fd"),
        ("/dev/stdin", "/proc/self/fd/0"),
        ("/dev/stdout", "/proc/self/fd/1"),
        ("/dev/stderr", "/proc/self/fd/2"),
    ] {
        std::os::unix::fs::symlink(target, link)?;
    }
    Ok(())
}

pub fn mount_dev_shm() -> Result<(), Error> {
    create_dir("/dev/shm")?;
    Ok(mount(
        Some("none"),
        "/dev/shm",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )?)
}

/// Bind-mounts a single device node (`null`, `zero`, `full`, `random`, `urandom`, `tty`)
/// from `/old_root/dev/<name>` into the freshly populated `/dev`.
pub fn bind_dev_node(name: &str) -> Result<(), Error> {
    let target = PathBuf::from("/dev").join(name);
    OpenOptions::new().create(true).write(true).open(&target)?;
    let source = PathBuf::from("/old_root/dev").join(name);
    Ok(mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)?)
}

pub fn mount_dev_mqueue() -> Result<(), Error> {
    create_dir("/dev/mqueue")?;
    Ok(mount(
        Some("none"),
        "/dev/mqueue",
        Some("mqueue"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )?)
}

pub fn mount_devpts() -> Result<(), Error> {
    create_dir("/dev/pts")?;
    mount(
        Some("none"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::empty(),
        Some("newinstance,mode=620,ptmxmode=666,gid=5"),
    )?;
    Ok(std::os::unix::fs::symlink("pts/ptmx", "/dev/ptmx")?)
}

/// Bind-mounts the controlling terminal onto `/dev/console`, for the `stdin` is a TTY
/// case. `tty_path` is `ttyname(stdin)` taken before `pivot_root`.
pub fn bind_console(tty_path: &Path) -> Result<(), Error> {
    OpenOptions::new().create(true).write(true).open("/dev/console")?;
    Ok(mount(
        Some(tty_path),
        "/dev/console",
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?)
}

pub fn mount_proc() -> Result<(), Error> {
    ignore_kind(create_dir_all("/proc"), ErrorKind::AlreadyExists)?;
    Ok(mount(
        Some("none"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None::<&str>,
    )?)
}

/// Mounts `/sys` and `/sys/fs/cgroup` fresh when we own a network namespace; otherwise
/// (`EPERM`) falls back to a recursive bind of the host's `/sys` through `/old_root`.
pub fn mount_sys() -> Result<(), Error> {
    ignore_kind(create_dir_all("/sys"), ErrorKind::AlreadyExists)?;
    match mount(Some("none"), "/sys", Some("sysfs"), MsFlags::empty(), None::<&str>) {
        Ok(()) => {
            create_dir_all("/sys/fs/cgroup")?;
            mount(
                Some("none"),
                "/sys/fs/cgroup",
                Some("cgroup2"),
                MsFlags::empty(),
                None::<&str>,
            )?;
            Ok(())
        }
        Err(Errno::EPERM) => Ok(mount(
            Some("/old_root/sys"),
            "/sys",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?),
        Err(err) => Err(err.into()),
    }
}

/// Creates a 0:0 character device at `path`, the overlay whiteout convention for "this
/// file was deleted in this layer".
pub fn make_whiteout_node(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(mknod(path, SFlag::S_IFCHR, Mode::empty(), makedev(0, 0))?)
}

/// Opens `path` as an `O_DIRECTORY` file descriptor that remains valid across
/// `pivot_root`, used to reach the layer directory for pid-file bookkeeping once the
/// mount namespace has moved on.
pub fn open_dir_handle(path: &Path) -> Result<OwnedFd, Error> {
    let fd = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
