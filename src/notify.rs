//! systemd readiness notification (`sd_notify(3)`), pure Rust reimplementation: connects
//! to `$NOTIFY_SOCKET` once and sends datagrams. A no-op when the variable is unset, since
//! that means we were not started under systemd (or an equivalent watcher).

use std::os::fd::OwnedFd;

use nix::sys::socket::{connect, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};

use crate::error::Error;

pub struct Notifier {
    socket: Option<OwnedFd>,
}

impl Notifier {
    /// Connects to `$NOTIFY_SOCKET` if present. Only `AF_UNIX` addresses (paths starting
    /// with `/`, or `@name` for the abstract namespace) are supported; anything else is
    /// rejected rather than silently ignored.
    pub fn from_env() -> Result<Self, Error> {
        let Ok(addr) = std::env::var("NOTIFY_SOCKET") else {
            return Ok(Self { socket: None });
        };
        let unix_addr = if let Some(name) = addr.strip_prefix('@') {
            UnixAddr::new_abstract(name.as_bytes())?
        } else if addr.starts_with('/') {
            UnixAddr::new(addr.as_str())?
        } else {
            return Err(Error::ProtocolUnsupported(
                "NOTIFY_SOCKET must be an AF_UNIX address".into(),
            ));
        };
        let fd = socket(AddressFamily::Unix, SockType::Datagram, SockFlag::empty(), None)?;
        connect(std::os::fd::AsRawFd::as_raw_fd(&fd), &unix_addr)?;
        Ok(Self { socket: Some(fd) })
    }

    fn send(&self, state: &str) -> Result<(), Error> {
        if let Some(fd) = &self.socket {
            nix::sys::socket::send(
                std::os::fd::AsRawFd::as_raw_fd(fd),
                state.as_bytes(),
                MsgFlags::empty(),
            )?;
        }
        Ok(())
    }

    pub fn ready(&self) -> Result<(), Error> {
        self.send("READY=1")
    }

    pub fn stopping(&self) -> Result<(), Error> {
        self.send("STOPPING=1")
    }
}
