//! Synthesized /proc files and directories.
//!
//! Content is frozen at open time: a fork after open does not change an
//! already-opened status file, and directory listings are a snapshot of the
//! namespace as it looked when the directory was opened. The read offset
//! doubles as the dirent cursor so repeated getdents64 calls page through
//! every visible entry.

use std::sync::Mutex;

use nix::errno::Errno;

use crate::error::{Error, Result};

use super::stat::Statx;

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub d_type: u8,
}

pub enum ProcKind {
    Dir(Vec<DirEntry>),
    File(Vec<u8>),
}

pub struct ProcFile {
    kind: ProcKind,
    guest_path: String,
    ino: u64,
    // byte offset for files, entry cursor for dirs
    offset: Mutex<u64>,
    closed: Mutex<bool>,
}

// linux_dirent64 header: d_ino(8) + d_off(8) + d_reclen(2) + d_type(1)
const DIRENT_HEADER: usize = 19;

/// Encodes entries starting at `cursor` into `buf` using the Linux
/// linux_dirent64 layout, reclen rounded up to a multiple of 8. Returns
/// (bytes written, new cursor). A buffer too small for even one record is
/// EINVAL, matching the kernel.
pub fn encode_dirents(entries: &[DirEntry], cursor: usize, buf: &mut [u8]) -> Result<(usize, usize)> {
    let mut written = 0;
    let mut cur = cursor;
    while cur < entries.len() {
        let e = &entries[cur];
        let reclen = (DIRENT_HEADER + e.name.len() + 1 + 7) & !7;
        if written + reclen > buf.len() {
            if written == 0 {
                return Err(Error::Os(Errno::EINVAL));
            }
            break;
        }
        let rec = &mut buf[written..written + reclen];
        rec.fill(0);
        rec[0..8].copy_from_slice(&e.ino.to_le_bytes());
        rec[8..16].copy_from_slice(&((cur + 1) as i64).to_le_bytes());
        rec[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
        rec[18] = e.d_type;
        rec[19..19 + e.name.len()].copy_from_slice(e.name.as_bytes());
        written += reclen;
        cur += 1;
    }
    Ok((written, cur))
}

impl ProcFile {
    pub fn dir(guest_path: String, ino: u64, entries: Vec<DirEntry>) -> Self {
        Self {
            kind: ProcKind::Dir(entries),
            guest_path,
            ino,
            offset: Mutex::new(0),
            closed: Mutex::new(false),
        }
    }

    pub fn file(guest_path: String, ino: u64, content: Vec<u8>) -> Self {
        Self {
            kind: ProcKind::File(content),
            guest_path,
            ino,
            offset: Mutex::new(0),
            closed: Mutex::new(false),
        }
    }

    pub fn guest_path(&self) -> &str {
        &self.guest_path
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ProcKind::Dir(_))
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.lock().unwrap() {
            return Err(Error::Os(Errno::EBADF));
        }
        Ok(())
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let content = match &self.kind {
            ProcKind::File(c) => c,
            ProcKind::Dir(_) => return Err(Error::Os(Errno::EISDIR)),
        };
        let mut off = self.offset.lock().unwrap();
        let start = (*off as usize).min(content.len());
        let n = (content.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&content[start..start + n]);
        *off += n as u64;
        Ok(n)
    }

    /// Snapshot arithmetic; the underlying content never changes after open.
    pub fn lseek(&self, offset: i64, whence: i32) -> Result<i64> {
        self.check_open()?;
        let len = match &self.kind {
            ProcKind::File(c) => c.len() as i64,
            ProcKind::Dir(e) => e.len() as i64,
        };
        let mut off = self.offset.lock().unwrap();
        let new = match whence {
            libc::SEEK_SET => offset,
            libc::SEEK_CUR => *off as i64 + offset,
            libc::SEEK_END => len + offset,
            _ => return Err(Error::Os(Errno::EINVAL)),
        };
        if new < 0 {
            return Err(Error::Os(Errno::EINVAL));
        }
        *off = new as u64;
        Ok(new)
    }

    pub fn getdents64(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let entries = match &self.kind {
            ProcKind::Dir(e) => e,
            ProcKind::File(_) => return Err(Error::Os(Errno::ENOTDIR)),
        };
        let mut off = self.offset.lock().unwrap();
        let (n, cur) = encode_dirents(entries, *off as usize, buf)?;
        *off = cur as u64;
        Ok(n)
    }

    pub fn statx(&self) -> Result<Statx> {
        self.check_open()?;
        let stx = match &self.kind {
            ProcKind::Dir(_) => Statx {
                mode: libc::S_IFDIR | 0o555,
                nlink: 2,
                size: 0,
                ino: self.ino,
                blksize: 4096,
                ..Default::default()
            },
            ProcKind::File(c) => Statx {
                mode: libc::S_IFREG | 0o444,
                nlink: 1,
                size: c.len() as u64,
                ino: self.ino,
                blksize: 4096,
                ..Default::default()
            },
        };
        Ok(stx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entries() -> Vec<DirEntry> {
        vec![
            DirEntry { ino: 1, name: ".".into(), d_type: libc::DT_DIR },
            DirEntry { ino: 1, name: "..".into(), d_type: libc::DT_DIR },
            DirEntry { ino: 2, name: "self".into(), d_type: libc::DT_LNK },
            DirEntry { ino: 3, name: "12345".into(), d_type: libc::DT_DIR },
        ]
    }

    #[test]
    fn dirent_layout() {
        let mut buf = [0u8; 256];
        let (n, cur) = encode_dirents(&entries(), 0, &mut buf).unwrap();
        assert_eq!(cur, 4);
        // first record: ino 1, name "."
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 1);
        let reclen = u16::from_le_bytes(buf[16..18].try_into().unwrap()) as usize;
        assert_eq!(reclen % 8, 0);
        assert_eq!(buf[18], libc::DT_DIR);
        assert_eq!(buf[19], b'.');
        assert_eq!(buf[20], 0);
        assert!(n >= reclen);
    }

    #[test]
    fn dirents_page_across_calls() {
        let all = entries();
        // room for roughly one record at a time
        let mut buf = [0u8; 32];
        let mut cursor = 0;
        let mut names = Vec::new();
        loop {
            let (n, cur) = encode_dirents(&all, cursor, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            let mut at = 0;
            while at < n {
                let reclen = u16::from_le_bytes(buf[at + 16..at + 18].try_into().unwrap()) as usize;
                let name_end = buf[at + 19..at + reclen]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap();
                names.push(String::from_utf8_lossy(&buf[at + 19..at + 19 + name_end]).into_owned());
                at += reclen;
            }
            cursor = cur;
        }
        assert_eq!(names, vec![".", "..", "self", "12345"]);
    }

    #[test]
    fn tiny_buffer_is_einval() {
        let mut buf = [0u8; 8];
        assert!(encode_dirents(&entries(), 0, &mut buf).is_err());
    }

    #[test]
    fn file_read_and_seek() {
        let f = ProcFile::file("/proc/1/status".into(), 9, b"Pid:\t1\n".to_vec());
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"Pid:");
        assert_eq!(f.lseek(0, libc::SEEK_SET).unwrap(), 0);
        let mut rest = [0u8; 64];
        assert_eq!(f.read(&mut rest).unwrap(), 7);
        assert_eq!(f.lseek(-2, libc::SEEK_END).unwrap(), 5);
        assert!(f.lseek(-100, libc::SEEK_CUR).is_err());
    }

    #[test]
    fn statx_modes() {
        let d = ProcFile::dir("/proc".into(), 1, entries());
        let st = d.statx().unwrap();
        assert_eq!(st.mode, libc::S_IFDIR | 0o555);
        assert_eq!(st.nlink, 2);
        assert_eq!(st.size, 0);

        let f = ProcFile::file("/proc/1/status".into(), 2, vec![0; 10]);
        let st = f.statx().unwrap();
        assert_eq!(st.mode, libc::S_IFREG | 0o444);
        assert_eq!(st.nlink, 1);
        assert_eq!(st.size, 10);
    }

    #[test]
    fn closed_file_is_ebadf() {
        let f = ProcFile::file("/proc/1/status".into(), 2, vec![1, 2, 3]);
        f.close();
        let mut buf = [0u8; 4];
        assert!(f.read(&mut buf).is_err());
        assert!(f.statx().is_err());
    }
}
