use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::libc::{syscall, SYS_pidfd_getfd, SYS_pidfd_open};
use tracing::trace;

use crate::error::{Error, Result};

/// Bounded geometric backoff for pidfd_getfd: the guest may not have
/// installed the target fd yet when we go looking for it.
const GETFD_ATTEMPTS: u32 = 100;
const GETFD_INITIAL: Duration = Duration::from_nanos(100);
const GETFD_FACTOR: f64 = 1.1;

pub struct PidFd(OwnedFd);

impl PidFd {
    pub fn open(pid: i32) -> std::io::Result<Self> {
        let fd = unsafe { syscall(SYS_pidfd_open, pid, 0) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd as _) };
        Ok(Self(fd))
    }

    /// Duplicates `target_fd` out of the referenced process.
    pub fn get_fd(&self, target_fd: RawFd) -> std::io::Result<OwnedFd> {
        let fd = unsafe { syscall(SYS_pidfd_getfd, self.as_raw_fd(), target_fd, 0) };
        if fd == -1 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd as _) })
    }

    /// get_fd with retry: up to 100 attempts, 100 ns initial delay, 1.1x
    /// geometric backoff.
    pub async fn get_fd_retry(&self, target_fd: RawFd) -> Result<OwnedFd> {
        let mut delay = GETFD_INITIAL;
        for attempt in 0..GETFD_ATTEMPTS {
            match self.get_fd(target_fd) {
                Ok(fd) => return Ok(fd),
                Err(e) => {
                    trace!(
                        target: "prefork",
                        "pidfd_getfd attempt {} failed: {}", attempt, e
                    );
                }
            }
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(GETFD_FACTOR);
        }
        Err(Error::Timeout)
    }
}

impl AsRawFd for PidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for PidFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
