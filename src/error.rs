use thiserror::Error;

/// Errors surfaced by the launcher, puller, config store and tar reader.
///
/// Mirrors the kinds laid out in the error handling design: callers branch on
/// `Syscall { errno, .. }` to decide whether a privileged fallback applies (e.g. `EPERM`
/// when `/sys` cannot be freshly mounted), and on `ArchNotAvailable` to report the
/// offered platforms back to the user.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("layer is already running (pid {0})")]
    AlreadyRunning(i32),

    #[error("invalid configuration: {0}")]
    ConfigParse(String),

    #[error("syscall {call} failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("unsupported: {0}")]
    ProtocolUnsupported(String),

    #[error("registry authentication failed: {0}")]
    RegistryAuth(String),

    #[error("no manifest for this platform; available: {available:?}")]
    ArchNotAvailable { available: Vec<String> },

    #[error("child process crashed: {0}")]
    ChildCrashed(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("invalid UTF-8 data: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl From<nix::Error> for Error {
    fn from(source: nix::Error) -> Self {
        Error::Syscall {
            call: "unknown",
            source,
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

pub(crate) trait SyscallContext<T> {
    fn syscall(self, call: &'static str) -> Result<T, Error>;
}

impl<T> SyscallContext<T> for Result<T, nix::Error> {
    fn syscall(self, call: &'static str) -> Result<T, Error> {
        self.map_err(|source| Error::Syscall { call, source })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
