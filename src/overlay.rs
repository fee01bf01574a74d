//! Per-sandbox staging tree on the host.
//!
//! Layout under `<base>/<uid>/`:
//!   - `cow/<absolute-path>` lazily mirrors host paths the guest writes to
//!   - `tmp/<absolute-path-minus-/tmp>` holds the guest's private /tmp
//!
//! The uid is 16 lowercase hex chars; tests pin it so overlay paths stay
//! deterministic.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const UID_LEN: usize = 16;

pub struct OverlayRoot {
    uid: String,
    root: PathBuf,
}

fn random_uid() -> Result<String> {
    let mut raw = [0u8; UID_LEN / 2];
    fs::File::open("/dev/urandom")?.read_exact(&mut raw)?;
    Ok(hex::encode(raw))
}

impl OverlayRoot {
    pub fn new(base: &Path, uid: Option<&str>) -> Result<Self> {
        let uid = match uid {
            Some(u) => {
                if u.len() != UID_LEN || !u.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
                    return Err(Error::Parse("sandbox uid must be 16 lowercase hex chars"));
                }
                u.to_string()
            }
            None => random_uid()?,
        };
        let root = base.join(&uid);
        // a half-created root is removed again on failure
        let cleanup = scopeguard::guard(root.clone(), |r| {
            let _ = fs::remove_dir_all(r);
        });
        fs::create_dir_all(root.join("cow"))?;
        fs::create_dir_all(root.join("tmp"))?;
        scopeguard::ScopeGuard::into_inner(cleanup);
        debug!(target: "supervisor", "overlay root at {}", root.display());
        Ok(Self { uid, root })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/cow/<p>`. `p` must be absolute and normalized.
    pub fn resolve_cow(&self, p: &str) -> PathBuf {
        self.root.join("cow").join(p.trim_start_matches('/'))
    }

    /// `<root>/tmp/<p minus /tmp>`. `p` must start with `/tmp`.
    pub fn resolve_tmp(&self, p: &str) -> Result<PathBuf> {
        let rest = match p.strip_prefix("/tmp") {
            Some(r) => r.trim_start_matches('/'),
            None => return Err(Error::InvalidPath),
        };
        Ok(self.root.join("tmp").join(rest))
    }

    /// Creates every ancestor of `p` under `cow/`.
    pub fn create_cow_parent_dirs(&self, p: &str) -> Result<()> {
        if let Some(parent) = self.resolve_cow(p).parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn cow_exists(&self, p: &str) -> bool {
        self.resolve_cow(p).symlink_metadata().is_ok()
    }

    pub fn tmp_exists(&self, p: &str) -> bool {
        match self.resolve_tmp(p) {
            Ok(path) => path.symlink_metadata().is_ok(),
            Err(_) => false,
        }
    }

    /// Whether the guest sees `p` as a directory: the COW overlay wins, then
    /// the real filesystem.
    pub fn is_guest_dir(&self, p: &str) -> bool {
        let cow = self.resolve_cow(p);
        if let Ok(meta) = cow.metadata() {
            return meta.is_dir();
        }
        Path::new(p).metadata().map(|m| m.is_dir()).unwrap_or(false)
    }

    /// Copies the host file at `p` into the COW location, creating parent
    /// directories first. No-op when a COW copy already exists.
    pub fn cow_copy_in(&self, p: &str) -> Result<PathBuf> {
        let dst = self.resolve_cow(p);
        if dst.symlink_metadata().is_ok() {
            return Ok(dst);
        }
        self.create_cow_parent_dirs(p)?;
        let src = Path::new(p);
        match src.metadata() {
            Ok(meta) if meta.is_dir() => {
                fs::create_dir(&dst)?;
            }
            Ok(_) => {
                fs::copy(src, &dst)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(dst)
    }

    /// Recursive delete of the uid subtree.
    pub fn teardown(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.raw_os_error() != Some(Errno::ENOENT as i32) {
                warn!(target: "supervisor", "overlay teardown failed: {}", e);
            }
        }
    }
}
