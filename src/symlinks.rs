//! Short symlink pool for in-place path rewrites.
//!
//! Guest path arguments live in guest memory with whatever length the guest
//! allotted, so a rewritten path must never be longer than the original.
//! Slots under the fixed root use a three-character base-37 code, giving
//! every rewritten path the fixed form `/.b/xyz` (7 bytes).

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::warn;

use crate::error::{Error, Result};

const ALPHABET: &[u8; 37] = b"0123456789abcdefghijklmnopqrstuvwxyz_";
pub const CODE_LEN: usize = 3;
pub const POOL_CAPACITY: usize = 37 * 37 * 37;

pub struct SymlinkPool {
    root: PathBuf,
    next: usize,
    live: BTreeMap<usize, PathBuf>,
}

fn encode(mut slot: usize) -> String {
    let mut code = [0u8; CODE_LEN];
    for c in code.iter_mut().rev() {
        *c = ALPHABET[slot % 37];
        slot /= 37;
    }
    String::from_utf8(code.to_vec()).unwrap()
}

impl SymlinkPool {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            next: 0,
            live: BTreeMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocates a slot symlinking to `target` and returns the slot path.
    pub fn alloc(&mut self, target: &Path) -> Result<PathBuf> {
        let mut probed = 0;
        while probed < POOL_CAPACITY {
            let slot = self.next;
            self.next = (self.next + 1) % POOL_CAPACITY;
            probed += 1;
            if self.live.contains_key(&slot) {
                continue;
            }
            let link = self.root.join(encode(slot));
            // a stale link from a crashed sandbox may occupy the name
            let _ = fs::remove_file(&link);
            symlink(target, &link)?;
            self.live.insert(slot, link.clone());
            return Ok(link);
        }
        Err(Error::Os(Errno::EMFILE))
    }

    pub fn release(&mut self, link: &Path) {
        if let Some(slot) = self
            .live
            .iter()
            .find(|(_, p)| p.as_path() == link)
            .map(|(s, _)| *s)
        {
            let _ = fs::remove_file(link);
            self.live.remove(&slot);
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Unlinks every allocated slot and tries to remove the root, which
    /// succeeds only when no other sandbox holds it.
    pub fn teardown(&mut self) {
        for (_, link) in std::mem::take(&mut self.live) {
            if let Err(e) = fs::remove_file(&link) {
                if e.raw_os_error() != Some(Errno::ENOENT as i32) {
                    warn!(target: "supervisor", "symlink teardown: {}: {}", link.display(), e);
                }
            }
        }
        let _ = fs::remove_dir(&self.root);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(".bvisor-pool-{}", name))
    }

    #[test]
    fn codes_are_three_chars_base37() {
        assert_eq!(encode(0), "000");
        assert_eq!(encode(36), "00_");
        assert_eq!(encode(37), "010");
        assert_eq!(encode(POOL_CAPACITY - 1), "___");
    }

    #[test]
    fn alloc_release_teardown() {
        let root = pool_root("basic");
        let mut pool = SymlinkPool::new(&root).unwrap();

        let a = pool.alloc(Path::new("/etc/hosts")).unwrap();
        let b = pool.alloc(Path::new("/etc/hostname")).unwrap();
        assert_ne!(a, b);
        assert_eq!(fs::read_link(&a).unwrap(), Path::new("/etc/hosts"));
        assert_eq!(pool.len(), 2);

        pool.release(&a);
        assert_eq!(pool.len(), 1);
        assert!(!a.exists());

        pool.teardown();
        assert!(!b.exists());
        assert!(!root.exists());
    }

    #[test]
    fn rewritten_path_is_bounded() {
        let root = pool_root("bounded");
        let mut pool = SymlinkPool::new(&root).unwrap();
        let link = pool.alloc(Path::new("/some/very/long/overlay/target")).unwrap();
        let name = link.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), CODE_LEN);
        pool.teardown();
    }
}
