//! Byte I/O handlers. Transfers stage through a bounded supervisor-local
//! buffer; a count larger than the buffer completes short, which is a valid
//! result for read/write.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{Error, Result};
use crate::file::File;
use crate::guestmem;
use crate::notif::{self, Notification, Reply};
use crate::supervisor::Supervisor;

use super::{read_struct, IOV_MAX_HANDLED, STAGE_MAX};

/// Pins the caller's file for fd, releasing the state lock before I/O.
async fn pin_file(sup: &Supervisor, tid: i32, fd: i32) -> Result<Arc<File>> {
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(tid)?;
    caller.fdt().lookup(fd)
}

pub async fn read(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if fd == 0 {
        // real stdin
        return Ok(Reply::Continue);
    }
    let file = pin_file(sup, n.tid, fd).await?;
    let count = n.args[2] as usize;
    let mut stage = vec![0u8; count.min(STAGE_MAX)];
    let nread = file.read(&mut stage)?;
    guestmem::write_all(n.tid, n.args[1], &stage[..nread])?;
    Ok(Reply::Value(nread as i64))
}

pub async fn write(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if fd == 1 || fd == 2 {
        // real stdout/stderr
        return Ok(Reply::Continue);
    }
    let file = pin_file(sup, n.tid, fd).await?;
    let count = n.args[2] as usize;
    let mut stage = vec![0u8; count.min(STAGE_MAX)];
    guestmem::read_exact(n.tid, n.args[1], &mut stage)?;
    let nwritten = file.write(&stage)?;
    Ok(Reply::Value(nwritten as i64))
}

#[derive(Clone, Copy)]
#[repr(C)]
struct GuestIovec {
    base: u64,
    len: u64,
}

fn read_iovecs(tid: i32, addr: u64, iovcnt: i32) -> Result<Vec<GuestIovec>> {
    if iovcnt < 0 {
        return Err(Error::Os(Errno::EINVAL));
    }
    // anything beyond the handled window is silently truncated
    let cnt = (iovcnt as usize).min(IOV_MAX_HANDLED);
    let mut out = Vec::with_capacity(cnt);
    for i in 0..cnt {
        let iov: GuestIovec = read_struct(tid, addr + (i * 16) as u64)?;
        out.push(iov);
    }
    Ok(out)
}

pub async fn readv(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if fd == 0 {
        return Ok(Reply::Continue);
    }
    let file = pin_file(sup, n.tid, fd).await?;
    let iovs = read_iovecs(n.tid, n.args[1], n.args[2] as i32)?;

    let total: usize = iovs.iter().map(|v| v.len as usize).sum();
    let mut stage = vec![0u8; total.min(STAGE_MAX)];
    let nread = file.read(&mut stage)?;

    // scatter back out across the vector
    let mut done = 0;
    for iov in &iovs {
        if done >= nread {
            break;
        }
        let chunk = (nread - done).min(iov.len as usize);
        guestmem::write_all(n.tid, iov.base, &stage[done..done + chunk])?;
        done += chunk;
    }
    Ok(Reply::Value(nread as i64))
}

pub async fn writev(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if fd == 1 || fd == 2 {
        return Ok(Reply::Continue);
    }
    let file = pin_file(sup, n.tid, fd).await?;
    let iovs = read_iovecs(n.tid, n.args[1], n.args[2] as i32)?;

    // gather into the staging buffer, stopping when it fills
    let mut stage = Vec::with_capacity(STAGE_MAX);
    for iov in &iovs {
        if stage.len() >= STAGE_MAX {
            break;
        }
        let want = (iov.len as usize).min(STAGE_MAX - stage.len());
        let start = stage.len();
        stage.resize(start + want, 0);
        guestmem::read_exact(n.tid, iov.base, &mut stage[start..])?;
    }
    let nwritten = file.write(&stage)?;
    Ok(Reply::Value(nwritten as i64))
}

pub async fn eventfd2(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let initval = n.args[0] as u32;
    let flags = n.args[1] as i32;
    let known = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE;
    if flags & !known != 0 {
        return Err(Error::Os(Errno::EINVAL));
    }
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let file = File::event(initval, flags & !libc::EFD_CLOEXEC)?;
    let vfd = caller.fdt().insert(file, flags & libc::EFD_CLOEXEC != 0);
    Ok(Reply::Value(i64::from(vfd)))
}

/// The kernel cannot hand us the fds a CONTINUE'd pipe2 would create, so the
/// supervisor makes the pipe itself and injects both ends into the guest via
/// addfd, mirroring them as passthrough files in the virtual table.
pub async fn pipe2(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let flags = n.args[1] as i32;
    let known = libc::O_CLOEXEC | libc::O_NONBLOCK | libc::O_DIRECT;
    if flags & !known != 0 {
        return Err(Error::Os(Errno::EINVAL));
    }
    let cloexec = flags & libc::O_CLOEXEC != 0;

    let oflags = nix::fcntl::OFlag::from_bits_truncate(flags);
    let (r, w) = nix::unistd::pipe2(oflags)?;

    let g0 = notif::add_fd(sup.notif_fd(), n.id, r.as_raw_fd(), cloexec)?;
    let g1 = notif::add_fd(sup.notif_fd(), n.id, w.as_raw_fd(), cloexec)?;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    caller.fdt().insert_at(g0, File::from_owned(r, None), cloexec);
    caller.fdt().insert_at(g1, File::from_owned(w, None), cloexec);

    let pair = [g0, g1];
    let bytes = unsafe { std::slice::from_raw_parts(pair.as_ptr() as *const u8, 8) };
    guestmem::write_all(n.tid, n.args[0], bytes)?;
    debug!(target: "guest", "tid {} pipe2 -> guest fds {} {}", n.tid, g0, g1);
    Ok(Reply::Value(0))
}
