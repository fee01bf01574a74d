//! Per-process filesystem info (cwd/root/umask), shared on CLONE_FS.

use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct FsState {
    cwd: String,
    root: String,
    umask: u32,
}

pub struct FsInfo {
    // object-local; never held across await points
    state: Mutex<FsState>,
}

impl FsInfo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FsState {
                cwd: "/".to_string(),
                root: "/".to_string(),
                umask: 0o022,
            }),
        })
    }

    /// CLONE_FS shares the object; otherwise the child gets a copy.
    pub fn fork(self: &Arc<Self>, shared: bool) -> Arc<Self> {
        if shared {
            self.clone()
        } else {
            Arc::new(Self {
                state: Mutex::new(self.state.lock().unwrap().clone()),
            })
        }
    }

    pub fn cwd(&self) -> String {
        self.state.lock().unwrap().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: String) {
        self.state.lock().unwrap().cwd = cwd;
    }

    pub fn root(&self) -> String {
        self.state.lock().unwrap().root.clone()
    }

    pub fn umask(&self) -> u32 {
        self.state.lock().unwrap().umask
    }

    pub fn set_umask(&self, umask: u32) -> u32 {
        let mut st = self.state.lock().unwrap();
        std::mem::replace(&mut st.umask, umask & 0o777)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_fork_sees_mutations() {
        let a = FsInfo::new();
        let b = a.fork(true);
        a.set_cwd("/tmp".to_string());
        assert_eq!(b.cwd(), "/tmp");
    }

    #[test]
    fn cloned_fork_does_not() {
        let a = FsInfo::new();
        let b = a.fork(false);
        a.set_cwd("/tmp".to_string());
        assert_eq!(b.cwd(), "/");
    }

    #[test]
    fn umask_swap() {
        let fs = FsInfo::new();
        assert_eq!(fs.set_umask(0o077), 0o022);
        assert_eq!(fs.umask(), 0o077);
    }
}
