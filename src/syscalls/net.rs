//! Socket and ioctl handlers. Sockets are host sockets wrapped in the
//! socket backend; every other backend answers the socket family with
//! ENOTSOCK.

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::file::File;
use crate::guestmem;
use crate::notif::{Notification, Reply};
use crate::supervisor::Supervisor;

use super::{read_struct, write_struct, IOV_MAX_HANDLED, STAGE_MAX};

const ADDR_MAX: usize = std::mem::size_of::<libc::sockaddr_storage>();

pub async fn ioctl(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if (0..=2).contains(&fd) {
        return Ok(Reply::Continue);
    }
    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let ret = file.ioctl(n.args[1], n.args[2])?;
    Ok(Reply::Value(ret))
}

pub async fn socket(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let domain = n.args[0] as i32;
    let ty = n.args[1] as i32;
    let protocol = n.args[2] as i32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let file = File::socket(domain, ty & !(libc::SOCK_CLOEXEC), protocol)?;
    let cloexec = ty & libc::SOCK_CLOEXEC != 0;
    let vfd = caller.fdt().insert(file, cloexec);
    Ok(Reply::Value(i64::from(vfd)))
}

pub async fn socketpair(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let domain = n.args[0] as i32;
    let ty = n.args[1] as i32;
    let protocol = n.args[2] as i32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let (a, b) = File::socketpair(domain, ty & !(libc::SOCK_CLOEXEC), protocol)?;
    let cloexec = ty & libc::SOCK_CLOEXEC != 0;
    let v0 = caller.fdt().insert(a, cloexec);
    let v1 = caller.fdt().insert(b, cloexec);

    let pair = [v0, v1];
    let bytes = unsafe { std::slice::from_raw_parts(pair.as_ptr() as *const u8, 8) };
    guestmem::write_all(n.tid, n.args[3], bytes)?;
    Ok(Reply::Value(0))
}

fn read_addr(tid: i32, addr: u64, len: usize) -> Result<Vec<u8>> {
    if len > ADDR_MAX {
        return Err(Error::Os(Errno::EINVAL));
    }
    let mut buf = vec![0u8; len];
    guestmem::read_exact(tid, addr, &mut buf)?;
    Ok(buf)
}

pub async fn connect(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let len = n.args[2] as usize;
    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let addr = read_addr(n.tid, n.args[1], len)?;
    file.connect(&addr)?;
    Ok(Reply::Value(0))
}

pub async fn shutdown(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    file.shutdown(n.args[1] as i32)?;
    Ok(Reply::Value(0))
}

pub async fn sendto(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let count = n.args[2] as usize;
    let flags = n.args[3] as i32;
    let addr_ptr = n.args[4];
    let addr_len = n.args[5] as usize;

    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let mut stage = vec![0u8; count.min(STAGE_MAX)];
    guestmem::read_exact(n.tid, n.args[1], &mut stage)?;
    let addr = if addr_ptr != 0 && addr_len > 0 {
        Some(read_addr(n.tid, addr_ptr, addr_len)?)
    } else {
        None
    };
    let nsent = file.sendto(&stage, flags, addr.as_deref())?;
    Ok(Reply::Value(nsent as i64))
}

pub async fn recvfrom(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let count = n.args[2] as usize;
    let flags = n.args[3] as i32;
    let src_ptr = n.args[4];
    let srclen_ptr = n.args[5];

    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let mut stage = vec![0u8; count.min(STAGE_MAX)];
    let (nread, addr) = file.recvfrom(&mut stage, flags)?;
    guestmem::write_all(n.tid, n.args[1], &stage[..nread])?;

    if src_ptr != 0 && srclen_ptr != 0 {
        if let Some(addr) = addr {
            let guest_cap: u32 = read_struct(n.tid, srclen_ptr)?;
            let put = addr.len().min(guest_cap as usize);
            guestmem::write_all(n.tid, src_ptr, &addr[..put])?;
            write_struct(n.tid, srclen_ptr, &(addr.len() as u32))?;
        }
    }
    Ok(Reply::Value(nread as i64))
}

/// Guest-side msghdr, 64-bit Linux layout.
#[derive(Clone, Copy)]
#[repr(C)]
struct GuestMsghdr {
    name: u64,
    namelen: u32,
    _pad0: u32,
    iov: u64,
    iovlen: u64,
    control: u64,
    controllen: u64,
    flags: i32,
    _pad1: i32,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct GuestIovec {
    base: u64,
    len: u64,
}

fn read_msg_iovecs(tid: i32, msg: &GuestMsghdr) -> Result<Vec<GuestIovec>> {
    let cnt = (msg.iovlen as usize).min(IOV_MAX_HANDLED);
    let mut out = Vec::with_capacity(cnt);
    for i in 0..cnt {
        out.push(read_struct::<GuestIovec>(tid, msg.iov + (i * 16) as u64)?);
    }
    Ok(out)
}

pub async fn sendmsg(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let flags = n.args[2] as i32;

    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let msg: GuestMsghdr = read_struct(n.tid, n.args[1])?;
    if msg.controllen != 0 {
        // fd passing and other ancillary data stay outside the sandbox
        return Err(Error::Os(Errno::EINVAL));
    }
    let iovs = read_msg_iovecs(n.tid, &msg)?;

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
    let addr = if msg.name != 0 && msg.namelen > 0 {
        Some(read_addr(n.tid, msg.name, msg.namelen as usize)?)
    } else {
        None
    };
    let nsent = file.sendto(&stage, flags, addr.as_deref())?;
    Ok(Reply::Value(nsent as i64))
}

pub async fn recvmsg(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let flags = n.args[2] as i32;

    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let mut msg: GuestMsghdr = read_struct(n.tid, n.args[1])?;
    let iovs = read_msg_iovecs(n.tid, &msg)?;

    let total: usize = iovs.iter().map(|v| v.len as usize).sum();
    let mut stage = vec![0u8; total.min(STAGE_MAX)];
    let (nread, addr) = file.recvfrom(&mut stage, flags)?;

    let mut done = 0;
    for iov in &iovs {
        if done >= nread {
            break;
        }
        let chunk = (nread - done).min(iov.len as usize);
        guestmem::write_all(n.tid, iov.base, &stage[done..done + chunk])?;
        done += chunk;
    }

    if msg.name != 0 {
        if let Some(addr) = &addr {
            let put = addr.len().min(msg.namelen as usize);
            guestmem::write_all(n.tid, msg.name, &addr[..put])?;
            msg.namelen = addr.len() as u32;
        } else {
            msg.namelen = 0;
        }
    }
    // no ancillary data ever comes back
    msg.controllen = 0;
    write_struct(n.tid, n.args[1], &msg)?;
    Ok(Reply::Value(nread as i64))
}
