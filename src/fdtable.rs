//! Per-process virtual fd table.
//!
//! Maps virtual fds to open files with a per-slot cloexec bit. Tables are
//! shared by reference on CLONE_FILES and deep-copied otherwise (slots are
//! copied, the Files themselves are refcounted). Fds 0-2 belong to the
//! guest's real stdio and are never allocated here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::file::File;

/// 0, 1, 2 pass through to the guest's real stdio.
pub const MIN_USER_FD: i32 = 3;

#[derive(Clone)]
struct Slot {
    file: Arc<File>,
    cloexec: bool,
}

pub struct FdTable {
    slots: Mutex<BTreeMap<i32, Slot>>,
}

impl FdTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    /// CLONE_FILES shares the table; otherwise the child gets a slot copy
    /// with every File reference bumped.
    pub fn fork(self: &Arc<Self>, shared: bool) -> Arc<Self> {
        if shared {
            self.clone()
        } else {
            Arc::new(Self {
                slots: Mutex::new(self.slots.lock().unwrap().clone()),
            })
        }
    }

    fn lowest_free(slots: &BTreeMap<i32, Slot>) -> i32 {
        let mut fd = MIN_USER_FD;
        for k in slots.keys() {
            if *k < MIN_USER_FD {
                continue;
            }
            if *k != fd {
                break;
            }
            fd += 1;
        }
        fd
    }

    /// Inserts at the lowest free fd and returns it.
    pub fn insert(&self, file: Arc<File>, cloexec: bool) -> i32 {
        let mut slots = self.slots.lock().unwrap();
        let fd = Self::lowest_free(&slots);
        slots.insert(fd, Slot { file, cloexec });
        fd
    }

    /// Installs at a specific fd, silently replacing (and closing) any
    /// previous occupant, like dup2 semantics.
    pub fn insert_at(&self, fd: i32, file: Arc<File>, cloexec: bool) {
        let old = self
            .slots
            .lock()
            .unwrap()
            .insert(fd, Slot { file, cloexec });
        if let Some(old) = old {
            release(old.file);
        }
    }

    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        self.slots.lock().unwrap().get(&fd).map(|s| s.file.clone())
    }

    pub fn lookup(&self, fd: i32) -> Result<Arc<File>> {
        self.get(fd).ok_or(Error::Os(Errno::EBADF))
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<File>> {
        self.slots.lock().unwrap().remove(&fd).map(|s| s.file)
    }

    pub fn cloexec(&self, fd: i32) -> Result<bool> {
        self.slots
            .lock()
            .unwrap()
            .get(&fd)
            .map(|s| s.cloexec)
            .ok_or(Error::Os(Errno::EBADF))
    }

    pub fn set_cloexec(&self, fd: i32, cloexec: bool) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&fd) {
            Some(slot) => {
                slot.cloexec = cloexec;
                Ok(())
            }
            None => Err(Error::Os(Errno::EBADF)),
        }
    }

    /// dup: same File, lowest free fd, cloexec cleared.
    pub fn dup(&self, oldfd: i32) -> Result<i32> {
        let mut slots = self.slots.lock().unwrap();
        let file = slots
            .get(&oldfd)
            .map(|s| s.file.clone())
            .ok_or(Error::Os(Errno::EBADF))?;
        let fd = Self::lowest_free(&slots);
        slots.insert(fd, Slot { file, cloexec: false });
        Ok(fd)
    }

    /// dup3: honors the target fd and O_CLOEXEC.
    pub fn dup3(&self, oldfd: i32, newfd: i32, cloexec: bool) -> Result<i32> {
        if oldfd == newfd {
            return Err(Error::Os(Errno::EINVAL));
        }
        let mut slots = self.slots.lock().unwrap();
        let file = slots
            .get(&oldfd)
            .map(|s| s.file.clone())
            .ok_or(Error::Os(Errno::EBADF))?;
        let old = slots.insert(newfd, Slot { file, cloexec });
        drop(slots);
        if let Some(old) = old {
            release(old.file);
        }
        Ok(newfd)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }

    /// Closes every file this table holds the last reference to.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut *self.slots.lock().unwrap());
        for (_, slot) in slots {
            release(slot.file);
        }
    }
}

/// Drops one table reference to a File; the host fd closes with the final
/// reference.
pub fn release(file: Arc<File>) {
    if Arc::strong_count(&file) == 1 {
        file.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy() -> Arc<File> {
        File::event(0, 0).unwrap()
    }

    #[test]
    fn lowest_free_allocation() {
        let t = FdTable::new();
        assert_eq!(t.insert(dummy(), false), 3);
        assert_eq!(t.insert(dummy(), false), 4);
        assert_eq!(t.insert(dummy(), false), 5);
        t.remove(4);
        assert_eq!(t.insert(dummy(), false), 4);
        assert_eq!(t.insert(dummy(), false), 6);
    }

    #[test]
    fn dup_keeps_file_alive() {
        let t = FdTable::new();
        let fd = t.insert(dummy(), false);
        let dup = t.dup(fd).unwrap();
        assert_ne!(fd, dup);

        // closing the original leaves the dup usable
        let f = t.remove(fd).unwrap();
        release(f);
        let f = t.get(dup).unwrap();
        assert!(!f.is_closed());
        assert_eq!(f.write(&1u64.to_ne_bytes()).unwrap(), 8);

        // the final close releases the File
        let f = t.remove(dup).unwrap();
        release(f);
    }

    #[test]
    fn dup3_semantics() {
        let t = FdTable::new();
        let fd = t.insert(dummy(), false);
        assert!(t.dup3(fd, fd, false).is_err());
        assert_eq!(t.dup3(fd, 9, true).unwrap(), 9);
        assert!(t.cloexec(9).unwrap());
        assert!(!t.cloexec(fd).unwrap());
    }

    #[test]
    fn shared_fork_sees_mutations() {
        let parent = FdTable::new();
        let child = parent.fork(true);
        let fd = parent.insert(dummy(), false);
        assert!(child.get(fd).is_some());
        child.remove(fd);
        assert!(parent.get(fd).is_none());
    }

    #[test]
    fn copied_fork_is_independent() {
        let parent = FdTable::new();
        let fd = parent.insert(dummy(), false);
        let child = parent.fork(false);
        assert!(child.get(fd).is_some());

        let fd2 = parent.insert(dummy(), false);
        assert!(child.get(fd2).is_none());

        // slot removal in the child does not affect the parent
        child.remove(fd);
        assert!(parent.get(fd).is_some());
    }

    #[test]
    fn refcount_invariant() {
        let t = FdTable::new();
        let file = dummy();
        t.insert(file.clone(), false);
        t.dup(3).unwrap();
        // two slots plus our handle
        assert_eq!(Arc::strong_count(&file), 3);
    }
}
