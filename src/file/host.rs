//! Host-fd-backed open files: everything except the synthesized /proc
//! backend holds a real fd here.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;

use nix::errno::Errno;
use nix::unistd::Whence;

use crate::err;
use crate::error::{Error, Result};

use super::stat::Statx;

pub struct HostFile {
    // None once closed; ops on a closed file fail with EBADF
    fd: Mutex<Option<OwnedFd>>,
    guest_path: Option<String>,
}

impl HostFile {
    pub fn new(fd: OwnedFd, guest_path: Option<String>) -> Self {
        Self {
            fd: Mutex::new(Some(fd)),
            guest_path,
        }
    }

    pub fn guest_path(&self) -> Option<&str> {
        self.guest_path.as_deref()
    }

    pub fn raw(&self) -> Result<RawFd> {
        self.fd
            .lock()
            .unwrap()
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or(Error::Os(Errno::EBADF))
    }

    fn borrowed(&self) -> Result<BorrowedFd<'_>> {
        // the fd stays alive while self does; close() only swaps out the slot
        Ok(unsafe { BorrowedFd::borrow_raw(self.raw()?) })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(nix::unistd::read(self.borrowed()?, buf)?)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(nix::unistd::write(self.borrowed()?, data)?)
    }

    /// Dropping the OwnedFd closes the host fd; errors (including synthetic
    /// fds that were never opened) are ignored.
    pub fn close(&self) {
        drop(self.fd.lock().unwrap().take());
    }

    pub fn is_closed(&self) -> bool {
        self.fd.lock().unwrap().is_none()
    }

    pub fn statx(&self) -> Result<Statx> {
        Statx::from_fd(self.borrowed()?)
    }

    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        let whence = match whence {
            libc::SEEK_SET => Whence::SeekSet,
            libc::SEEK_CUR => Whence::SeekCur,
            libc::SEEK_END => Whence::SeekEnd,
            _ => return Err(Error::Os(Errno::EINVAL)),
        };
        Ok(nix::unistd::lseek(self.borrowed()?, offset, whence)?)
    }

    pub fn ioctl(&self, request: u64, arg: u64) -> Result<i64> {
        let fd = self.raw()?;
        let ret = err(|| unsafe { libc::ioctl(fd, request as _, arg) })?;
        Ok(ret as i64)
    }

    pub fn getdents64(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.raw()?;
        let n = err(|| {
            (unsafe {
                libc::syscall(
                    libc::SYS_getdents64,
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            }) as i64
        })?;
        Ok(n as usize)
    }

    pub fn getfl(&self) -> Result<i32> {
        let fd = self.raw()?;
        Ok(err(|| unsafe { libc::fcntl(fd, libc::F_GETFL) })?)
    }

    // socket ops; callers gate on the Socket backend tag

    pub fn connect(&self, addr: &[u8]) -> Result<()> {
        let fd = self.raw()?;
        err(|| unsafe {
            libc::connect(
                fd,
                addr.as_ptr() as *const libc::sockaddr,
                addr.len() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    pub fn shutdown(&self, how: i32) -> Result<()> {
        if !matches!(how, libc::SHUT_RD | libc::SHUT_WR | libc::SHUT_RDWR) {
            return Err(Error::Os(Errno::EINVAL));
        }
        let fd = self.raw()?;
        err(|| unsafe { libc::shutdown(fd, how) })?;
        Ok(())
    }

    pub fn sendto(&self, data: &[u8], flags: i32, addr: Option<&[u8]>) -> Result<usize> {
        let fd = self.raw()?;
        let (aptr, alen) = match addr {
            Some(a) => (a.as_ptr() as *const libc::sockaddr, a.len() as libc::socklen_t),
            None => (std::ptr::null(), 0),
        };
        let n = err(|| unsafe {
            libc::sendto(fd, data.as_ptr() as *const libc::c_void, data.len(), flags, aptr, alen)
        })?;
        Ok(n as usize)
    }

    pub fn recvfrom(&self, buf: &mut [u8], flags: i32) -> Result<(usize, Option<Vec<u8>>)> {
        let fd = self.raw()?;
        let mut storage = [0u8; std::mem::size_of::<libc::sockaddr_storage>()];
        let mut alen: libc::socklen_t = 0;
        let n = err(|| {
            // an interrupted attempt may have scribbled on alen
            alen = storage.len() as libc::socklen_t;
            unsafe {
                libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                    storage.as_mut_ptr() as *mut libc::sockaddr,
                    &mut alen,
                )
            }
        })?;
        let addr = if alen > 0 {
            Some(storage[..alen as usize].to_vec())
        } else {
            None
        };
        Ok((n as usize, addr))
    }
}

/// Opens a host path with raw open(2) flags, translating the accmode and
/// creation bits onto OpenOptions.
pub fn open_host(path: &Path, flags: i32, mode: u32) -> Result<OwnedFd> {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => {
            opts.read(true);
        }
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => return Err(Error::Os(Errno::EINVAL)),
    }
    if flags & libc::O_CREAT != 0 {
        opts.create(true);
    }
    if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
        opts.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        opts.append(true);
    }
    let extra = flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND | libc::O_CLOEXEC);
    opts.custom_flags(extra | libc::O_CLOEXEC);
    opts.mode(mode);
    let file = opts.open(path)?;
    Ok(file.into())
}

pub fn eventfd(initval: u32, flags: i32) -> Result<OwnedFd> {
    let fd = err(|| unsafe { libc::eventfd(initval, flags | libc::EFD_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> Result<OwnedFd> {
    let fd = err(|| unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn socketpair(domain: i32, ty: i32, protocol: i32) -> Result<(OwnedFd, OwnedFd)> {
    let mut sv = [0i32; 2];
    err(|| unsafe {
        libc::socketpair(domain, ty | libc::SOCK_CLOEXEC, protocol, sv.as_mut_ptr())
    })?;
    Ok((unsafe { OwnedFd::from_raw_fd(sv[0]) }, unsafe {
        OwnedFd::from_raw_fd(sv[1])
    }))
}
