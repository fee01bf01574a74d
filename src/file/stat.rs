//! Portable stat snapshot plus encoders for the two guest-facing layouts
//! (struct stat for fstat/newfstatat, struct statx for statx).

use std::os::fd::BorrowedFd;

use nix::sys::stat::fstat;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct Statx {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub ino: u64,
    pub dev: u64,
    pub rdev: u64,
    pub atime_sec: i64,
    pub atime_nsec: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub ctime_sec: i64,
    pub ctime_nsec: u32,
}

impl Statx {
    pub fn from_fd(fd: BorrowedFd<'_>) -> Result<Self> {
        let st = fstat(fd)?;
        Ok(Self::from_stat(&st))
    }

    pub fn from_stat(st: &libc::stat) -> Self {
        Self {
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size as u64,
            blksize: st.st_blksize as u32,
            blocks: st.st_blocks as u64,
            ino: st.st_ino,
            dev: st.st_dev,
            rdev: st.st_rdev,
            atime_sec: st.st_atime,
            atime_nsec: st.st_atime_nsec as u32,
            mtime_sec: st.st_mtime,
            mtime_nsec: st.st_mtime_nsec as u32,
            ctime_sec: st.st_ctime,
            ctime_nsec: st.st_ctime_nsec as u32,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn to_stat(&self) -> libc::stat {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_mode = self.mode as _;
        st.st_nlink = self.nlink as _;
        st.st_uid = self.uid;
        st.st_gid = self.gid;
        st.st_size = self.size as _;
        st.st_blksize = self.blksize as _;
        st.st_blocks = self.blocks as _;
        st.st_ino = self.ino;
        st.st_dev = self.dev;
        st.st_rdev = self.rdev;
        st.st_atime = self.atime_sec;
        st.st_atime_nsec = self.atime_nsec as _;
        st.st_mtime = self.mtime_sec;
        st.st_mtime_nsec = self.mtime_nsec as _;
        st.st_ctime = self.ctime_sec;
        st.st_ctime_nsec = self.ctime_nsec as _;
        st
    }

    pub fn to_statx(&self) -> libc::statx {
        let mut stx: libc::statx = unsafe { std::mem::zeroed() };
        stx.stx_mask = libc::STATX_BASIC_STATS;
        stx.stx_blksize = self.blksize;
        stx.stx_nlink = self.nlink;
        stx.stx_uid = self.uid;
        stx.stx_gid = self.gid;
        stx.stx_mode = self.mode as u16;
        stx.stx_ino = self.ino;
        stx.stx_size = self.size;
        stx.stx_blocks = self.blocks;
        stx.stx_atime.tv_sec = self.atime_sec;
        stx.stx_atime.tv_nsec = self.atime_nsec;
        stx.stx_mtime.tv_sec = self.mtime_sec;
        stx.stx_mtime.tv_nsec = self.mtime_nsec;
        stx.stx_ctime.tv_sec = self.ctime_sec;
        stx.stx_ctime.tv_nsec = self.ctime_nsec;
        stx.stx_dev_major = libc::major(self.dev);
        stx.stx_dev_minor = libc::minor(self.dev);
        stx.stx_rdev_major = libc::major(self.rdev);
        stx.stx_rdev_minor = libc::minor(self.rdev);
        stx
    }
}
