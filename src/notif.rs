//! Wire codec for the seccomp user-notification fd.
//!
//! A notification carries the caller tid, the syscall number and six raw
//! arguments; the reply carries either a synthetic (val, errno) pair or the
//! CONTINUE flag that lets the kernel run the syscall unchanged. The
//! supervisor replies exactly once per notification id; a stale id fails the
//! send ioctl with ENOENT, which callers treat as "guest already exited".

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::{ioctl_readwrite, ioctl_write_ptr};

use crate::error::Result;

const SECCOMP_IOC_MAGIC: u8 = b'!';

// SECCOMP_USER_NOTIF_FLAG_CONTINUE and SECCOMP_ADDFD_FLAG_SETFD from
// linux/seccomp.h; libc does not export the ioctl request values.
const NOTIF_FLAG_CONTINUE: u32 = 1;
const ADDFD_FLAG_SETFD: u32 = 1;

ioctl_readwrite!(seccomp_notif_recv, SECCOMP_IOC_MAGIC, 0, libc::seccomp_notif);
ioctl_readwrite!(
    seccomp_notif_send,
    SECCOMP_IOC_MAGIC,
    1,
    libc::seccomp_notif_resp
);
ioctl_write_ptr!(seccomp_notif_id_valid, SECCOMP_IOC_MAGIC, 2, u64);
ioctl_write_ptr!(
    seccomp_notif_addfd,
    SECCOMP_IOC_MAGIC,
    3,
    libc::seccomp_notif_addfd
);

/// One intercepted syscall.
#[derive(Debug, Clone, Copy)]
pub struct Notification {
    pub id: u64,
    /// Caller AbsTid.
    pub tid: i32,
    pub nr: i32,
    pub args: [u64; 6],
}

/// What the guest gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Let the kernel execute the syscall unchanged.
    Continue,
    /// Synthetic success with this return value.
    Value(i64),
    /// Synthetic failure; the guest sees -errno.
    Failure(Errno),
}

pub fn recv(fd: BorrowedFd<'_>) -> nix::Result<Notification> {
    // the RECV ioctl requires a zeroed buffer
    let mut raw: libc::seccomp_notif = unsafe { std::mem::zeroed() };
    unsafe { seccomp_notif_recv(fd.as_raw_fd(), &mut raw)? };
    Ok(Notification {
        id: raw.id,
        tid: raw.pid as i32,
        nr: raw.data.nr,
        args: raw.data.args,
    })
}

pub fn send(fd: BorrowedFd<'_>, id: u64, reply: Reply) -> nix::Result<()> {
    let mut resp: libc::seccomp_notif_resp = unsafe { std::mem::zeroed() };
    resp.id = id;
    match reply {
        Reply::Continue => resp.flags = NOTIF_FLAG_CONTINUE,
        Reply::Value(v) => resp.val = v,
        Reply::Failure(e) => resp.error = -(e as i32),
    }
    unsafe { seccomp_notif_send(fd.as_raw_fd(), &mut resp)? };
    Ok(())
}

/// Injects `src_fd` into the guest's fd table, letting the kernel pick the
/// guest fd number. Returns that number.
pub fn add_fd(fd: BorrowedFd<'_>, id: u64, src_fd: RawFd, cloexec: bool) -> Result<RawFd> {
    let mut req: libc::seccomp_notif_addfd = unsafe { std::mem::zeroed() };
    req.id = id;
    req.srcfd = src_fd as u32;
    if cloexec {
        req.newfd_flags = libc::O_CLOEXEC as u32;
    }
    let guest_fd = unsafe { seccomp_notif_addfd(fd.as_raw_fd(), &req)? };
    Ok(guest_fd)
}

/// Injects `src_fd` at a specific guest fd number (closing whatever was
/// there), like dup2 into the guest.
pub fn add_fd_at(
    fd: BorrowedFd<'_>,
    id: u64,
    src_fd: RawFd,
    guest_fd: RawFd,
    cloexec: bool,
) -> Result<RawFd> {
    let mut req: libc::seccomp_notif_addfd = unsafe { std::mem::zeroed() };
    req.id = id;
    req.srcfd = src_fd as u32;
    req.newfd = guest_fd as u32;
    req.flags = ADDFD_FLAG_SETFD;
    if cloexec {
        req.newfd_flags = libc::O_CLOEXEC as u32;
    }
    let out = unsafe { seccomp_notif_addfd(fd.as_raw_fd(), &req)? };
    Ok(out)
}

/// True while the notification id still refers to a live, paused guest task.
pub fn id_valid(fd: BorrowedFd<'_>, id: u64) -> bool {
    unsafe { seccomp_notif_id_valid(fd.as_raw_fd(), &id) }.is_ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn reply_encoding() {
        // mirror the flag/val/error encoding `send` applies
        let encode = |reply: Reply| -> (u32, i64, i32) {
            let mut resp: libc::seccomp_notif_resp = unsafe { std::mem::zeroed() };
            match reply {
                Reply::Continue => resp.flags = NOTIF_FLAG_CONTINUE,
                Reply::Value(v) => resp.val = v,
                Reply::Failure(e) => resp.error = -(e as i32),
            }
            (resp.flags, resp.val, resp.error)
        };

        assert_eq!(encode(Reply::Continue), (1, 0, 0));
        assert_eq!(encode(Reply::Value(12345)), (0, 12345, 0));
        assert_eq!(
            encode(Reply::Failure(Errno::EPERM)),
            (0, 0, -(Errno::EPERM as i32))
        );
    }

    #[test]
    fn recv_on_non_notif_fd_fails() {
        // an eventfd is not a seccomp notification fd; the ioctl must fail
        // with a plain errno rather than anything non-Linux
        let efd = nix::sys::eventfd::EventFd::new().unwrap();
        let res = recv(efd.as_fd());
        assert!(res.is_err());
    }
}
