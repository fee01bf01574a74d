//! PID namespaces as the supervisor models them.
//!
//! A namespace maps the threads visible in it (its own plus every thread of
//! descendant namespaces) to per-namespace tids. Registration cascades to
//! all ancestors, each assigning its own NsTid; unregistration cascades
//! identically. The parent link is strong: an ancestor namespace must
//! outlive its descendants.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::probe::MAX_NS_DEPTH;

struct NsState {
    next_nstid: i32,
    by_nstid: BTreeMap<i32, i32>,
    nstid_of: HashMap<i32, i32>,
}

pub struct Namespace {
    parent: Option<Arc<Namespace>>,
    depth: usize,
    state: Mutex<NsState>,
}

impl Namespace {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            depth: 0,
            state: Mutex::new(NsState {
                next_nstid: 1,
                by_nstid: BTreeMap::new(),
                nstid_of: HashMap::new(),
            }),
        })
    }

    pub fn child(self: &Arc<Self>) -> Result<Arc<Self>> {
        if self.depth + 1 >= MAX_NS_DEPTH {
            return Err(Error::Parse("namespace nesting too deep"));
        }
        Ok(Arc::new(Self {
            parent: Some(self.clone()),
            depth: self.depth + 1,
            state: Mutex::new(NsState {
                next_nstid: 1,
                by_nstid: BTreeMap::new(),
                nstid_of: HashMap::new(),
            }),
        }))
    }

    pub fn parent(&self) -> Option<&Arc<Namespace>> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn register_local(&self, tid: i32, nstid: Option<i32>) -> i32 {
        let mut st = self.state.lock().unwrap();
        if let Some(existing) = st.nstid_of.get(&tid) {
            return *existing;
        }
        let nstid = match nstid {
            Some(n) => n,
            // the root namespace mirrors kernel ids; inner namespaces run
            // their own counter
            None if self.is_root() => tid,
            None => {
                let mut n = st.next_nstid;
                while st.by_nstid.contains_key(&n) {
                    n += 1;
                }
                st.next_nstid = n + 1;
                n
            }
        };
        st.by_nstid.insert(nstid, tid);
        st.nstid_of.insert(tid, nstid);
        nstid
    }

    /// Registers in this namespace and every ancestor, each with a locally
    /// assigned NsTid.
    pub fn register(self: &Arc<Self>, tid: i32) {
        let mut ns = Some(self.clone());
        while let Some(n) = ns {
            n.register_local(tid, None);
            ns = n.parent.clone();
        }
    }

    /// Registers with kernel-assigned NsTids. `chain` is ordered outermost
    /// to innermost; its tail aligns with this namespace, walking outward.
    /// Namespaces deeper than the chain fall back to local assignment.
    pub fn register_chain(self: &Arc<Self>, tid: i32, chain: &[i32]) {
        let mut ns = Some(self.clone());
        let mut idx = chain.len();
        while let Some(n) = ns {
            let given = if idx > 0 {
                idx -= 1;
                Some(chain[idx])
            } else {
                None
            };
            n.register_local(tid, given);
            ns = n.parent.clone();
        }
    }

    /// Cascading removal from this namespace and all ancestors.
    pub fn unregister(&self, tid: i32) {
        let mut ns: Option<&Namespace> = Some(self);
        while let Some(n) = ns {
            let mut st = n.state.lock().unwrap();
            if let Some(nstid) = st.nstid_of.remove(&tid) {
                st.by_nstid.remove(&nstid);
            }
            ns = n.parent.as_deref();
        }
    }

    pub fn contains(&self, tid: i32) -> bool {
        self.state.lock().unwrap().nstid_of.contains_key(&tid)
    }

    pub fn nstid_of(&self, tid: i32) -> Option<i32> {
        self.state.lock().unwrap().nstid_of.get(&tid).copied()
    }

    pub fn abs_of(&self, nstid: i32) -> Option<i32> {
        self.state.lock().unwrap().by_nstid.get(&nstid).copied()
    }

    /// (nstid, abstid) pairs in nstid order.
    pub fn visible(&self) -> Vec<(i32, i32)> {
        self.state
            .lock()
            .unwrap()
            .by_nstid
            .iter()
            .map(|(n, a)| (*n, *a))
            .collect()
    }

    pub fn same(a: &Arc<Namespace>, b: &Arc<Namespace>) -> bool {
        Arc::ptr_eq(a, b)
    }
}
