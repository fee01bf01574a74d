//! Thread groups: the unit a tgid names.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

pub struct ThreadGroup {
    tgid: i32,
    // strong: the parent group must outlive this one for PPid reporting
    parent: Option<Arc<ThreadGroup>>,
    members: Mutex<BTreeSet<i32>>,
}

impl ThreadGroup {
    /// A fresh group led by `tgid` (the leader's tid).
    pub fn new(tgid: i32, parent: Option<Arc<ThreadGroup>>) -> Arc<Self> {
        Arc::new(Self {
            tgid,
            parent,
            members: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn tgid(&self) -> i32 {
        self.tgid
    }

    /// The leader's tid equals the tgid.
    pub fn leader(&self) -> i32 {
        self.tgid
    }

    pub fn parent(&self) -> Option<&Arc<ThreadGroup>> {
        self.parent.as_ref()
    }

    pub fn add(&self, tid: i32) {
        self.members.lock().unwrap().insert(tid);
    }

    pub fn remove(&self, tid: i32) {
        self.members.lock().unwrap().remove(&tid);
    }

    pub fn contains(&self, tid: i32) -> bool {
        self.members.lock().unwrap().contains(&tid)
    }

    pub fn members(&self) -> Vec<i32> {
        self.members.lock().unwrap().iter().copied().collect()
    }

    pub fn same(a: &Arc<ThreadGroup>, b: &Arc<ThreadGroup>) -> bool {
        Arc::ptr_eq(a, b)
    }
}
