//! Error taxonomy for the supervisor.
//!
//! Two layers: `Errno` carries the Linux errno set used by backends and
//! handlers directly, and the remaining variants are internal kinds produced
//! by the registry, the router and the codecs. Every internal kind maps to
//! exactly one errno via [`Error::errno`]; nothing crosses the reply boundary
//! without that mapping.

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Os(#[from] Errno),
    #[error("tid {0} is not in the registry")]
    NotInRegistry(i32),
    #[error("tid {0} is outside the sandbox subtree")]
    NotInSandbox(i32),
    #[error("parse error: {0}")]
    Parse(&'static str),
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("invalid path")]
    InvalidPath,
    #[error("unsupported clone flags {0:#x}")]
    UnsupportedCloneFlags(u64),
    #[error("timed out")]
    Timeout,
}

impl Error {
    /// The errno the guest sees for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Os(e) => *e,
            Error::NotInRegistry(_) => Errno::ESRCH,
            Error::NotInSandbox(_) => Errno::ESRCH,
            Error::Parse(_) => Errno::EINVAL,
            Error::BufferTooSmall => Errno::ENAMETOOLONG,
            Error::InvalidPath => Errno::ENOENT,
            Error::UnsupportedCloneFlags(_) => Errno::EINVAL,
            Error::Timeout => Errno::EAGAIN,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        // host-originated I/O failures collapse to the closest errno
        Error::Os(Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
    }
}
