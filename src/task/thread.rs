//! One guest thread.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::fdtable::FdTable;
use crate::fsinfo::FsInfo;

use super::namespace::Namespace;
use super::thread_group::ThreadGroup;

pub struct Thread {
    tid: i32,
    group: Arc<ThreadGroup>,
    ns: Arc<Namespace>,
    fdt: Arc<FdTable>,
    fs: Arc<FsInfo>,
    // weak relation: resolved through the registry, never ownership
    parent: Option<i32>,
    children: Mutex<BTreeSet<i32>>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread").field("tid", &self.tid).finish()
    }
}

impl Thread {
    pub fn new(
        tid: i32,
        group: Arc<ThreadGroup>,
        ns: Arc<Namespace>,
        fdt: Arc<FdTable>,
        fs: Arc<FsInfo>,
        parent: Option<i32>,
    ) -> Self {
        Self {
            tid,
            group,
            ns,
            fdt,
            fs,
            parent,
            children: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn group(&self) -> &Arc<ThreadGroup> {
        &self.group
    }

    pub fn ns(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn fdt(&self) -> &Arc<FdTable> {
        &self.fdt
    }

    pub fn fs(&self) -> &Arc<FsInfo> {
        &self.fs
    }

    pub fn parent(&self) -> Option<i32> {
        self.parent
    }

    pub fn add_child(&self, tid: i32) {
        self.children.lock().unwrap().insert(tid);
    }

    pub fn remove_child(&self, tid: i32) {
        self.children.lock().unwrap().remove(&tid);
    }

    pub fn children(&self) -> Vec<i32> {
        self.children.lock().unwrap().iter().copied().collect()
    }

    /// A thread roots its namespace iff it has no parent or its parent
    /// lives in a different namespace.
    pub fn is_ns_root(&self, parent: Option<&Thread>) -> bool {
        match parent {
            None => true,
            Some(p) => !Namespace::same(p.ns(), self.ns()),
        }
    }
}
