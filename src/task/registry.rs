//! The thread registry.
//!
//! Threads are discovered lazily: clone is never intercepted, so the first
//! notification from an unknown tid triggers a kernel probe that walks the
//! parent chain up to a registered ancestor, reconstructing clone flags from
//! namespace identity and kcmp along the way. A chain that leaves the
//! sandbox subtree fails registration with a distinguished error.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::fdtable::FdTable;
use crate::fsinfo::FsInfo;
use crate::probe::{self, TaskStatus};

use super::namespace::Namespace;
use super::thread::Thread;
use super::thread_group::ThreadGroup;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const THREAD = libc::CLONE_THREAD as u64;
        const FILES = libc::CLONE_FILES as u64;
        const FS = libc::CLONE_FS as u64;
        const PARENT = libc::CLONE_PARENT as u64;
        const NEWPID = libc::CLONE_NEWPID as u64;
        const NEWUSER = libc::CLONE_NEWUSER as u64;
        const NEWNET = libc::CLONE_NEWNET as u64;
        const NEWNS = libc::CLONE_NEWNS as u64;
    }
}

pub struct Threads {
    map: HashMap<i32, Arc<Thread>>,
    init_tid: i32,
}

impl Threads {
    /// Seeds the registry with the initial guest thread as the root of a
    /// fresh namespace tree.
    pub fn new(init_tid: i32) -> Self {
        let mut threads = Self {
            map: HashMap::new(),
            init_tid,
        };
        threads
            .create(init_tid, None, None, None, None, None, None)
            .expect("registering the initial thread cannot fail");
        threads
    }

    pub fn init_tid(&self) -> i32 {
        self.init_tid
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, tid: i32) -> Option<Arc<Thread>> {
        self.map.get(&tid).cloned()
    }

    pub fn lookup(&self, tid: i32) -> Result<Arc<Thread>> {
        self.get(tid).ok_or(Error::NotInRegistry(tid))
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        tid: i32,
        parent: Option<Arc<Thread>>,
        group: Option<Arc<ThreadGroup>>,
        ns: Option<Arc<Namespace>>,
        fdt: Option<Arc<FdTable>>,
        fs: Option<Arc<FsInfo>>,
        nspid_chain: Option<&[i32]>,
    ) -> Result<Arc<Thread>> {
        if self.map.contains_key(&tid) {
            return self.lookup(tid);
        }
        let group = match group {
            Some(g) => g,
            None => ThreadGroup::new(tid, parent.as_ref().map(|p| p.group().clone())),
        };
        let ns = match ns {
            Some(n) => n,
            None => match &parent {
                Some(p) => p.ns().child()?,
                None => Namespace::root(),
            },
        };
        let fdt = fdt.unwrap_or_else(FdTable::new);
        let fs = fs.unwrap_or_else(FsInfo::new);

        let thread = Arc::new(Thread::new(
            tid,
            group.clone(),
            ns.clone(),
            fdt,
            fs,
            parent.as_ref().map(|p| p.tid()),
        ));
        group.add(tid);
        match nspid_chain {
            Some(chain) => ns.register_chain(tid, chain),
            None => ns.register(tid),
        }
        if let Some(p) = &parent {
            p.add_child(tid);
        }
        self.map.insert(tid, thread.clone());
        trace!(target: "supervisor", "registered tid {}", tid);
        Ok(thread)
    }

    /// Clone semantics with explicit flags (the path tests drive directly;
    /// the live supervisor reconstructs flags through the probe instead).
    pub fn spawn(&mut self, parent_tid: i32, child_tid: i32, raw_flags: u64) -> Result<Arc<Thread>> {
        let flags = CloneFlags::from_bits_truncate(raw_flags);
        if flags.intersects(CloneFlags::NEWUSER | CloneFlags::NEWNET | CloneFlags::NEWNS) {
            return Err(Error::UnsupportedCloneFlags(raw_flags));
        }
        // clone(2) refuses this pairing too: a thread cannot join its
        // group's namespace and a fresh one at the same time
        if flags.contains(CloneFlags::THREAD | CloneFlags::NEWPID) {
            return Err(Error::UnsupportedCloneFlags(raw_flags));
        }
        let cloner = self.lookup(parent_tid)?;

        // CLONE_PARENT: the child becomes a sibling of the cloner
        let parent = if flags.contains(CloneFlags::PARENT) {
            cloner.parent().and_then(|p| self.get(p))
        } else {
            Some(cloner.clone())
        };

        let group = flags
            .contains(CloneFlags::THREAD)
            .then(|| cloner.group().clone());
        let ns = if flags.contains(CloneFlags::NEWPID) {
            None
        } else {
            Some(cloner.ns().clone())
        };
        let fdt = cloner.fdt().fork(flags.contains(CloneFlags::FILES));
        let fs = cloner.fs().fork(flags.contains(CloneFlags::FS));
        self.create(child_tid, parent, group, ns, Some(fdt), Some(fs), None)
    }

    /// Looks up a tid, probing kernel state to register it (and any
    /// unregistered ancestors) when unknown.
    pub fn lookup_or_register(&mut self, tid: i32) -> Result<Arc<Thread>> {
        if let Some(t) = self.get(tid) {
            return Ok(t);
        }
        self.register_lazy(tid, 0)
    }

    fn register_lazy(&mut self, tid: i32, depth: usize) -> Result<Arc<Thread>> {
        if let Some(t) = self.get(tid) {
            return Ok(t);
        }
        // a parent chain longer than the pid space means /proc changed
        // underneath us
        if depth > 0x10000 {
            return Err(Error::NotInSandbox(tid));
        }
        let st = probe::task_status(tid)?;
        self.register_probed(&st, depth)
    }

    fn register_probed(&mut self, st: &TaskStatus, depth: usize) -> Result<Arc<Thread>> {
        if st.tgid != st.tid {
            // CLONE_THREAD child: anchor on the group leader. Its PPid is the
            // process parent, which for the init group lies outside the
            // sandbox and must not decide membership.
            let leader = self.register_lazy(st.tgid, depth + 1)?;
            let parent = leader.parent().and_then(|p| self.get(p));
            let shared_files = probe::same_files(leader.tid(), st.tid).unwrap_or(true);
            let shared_fs = probe::same_fs(leader.tid(), st.tid).unwrap_or(true);
            debug!(
                target: "supervisor",
                "lazy register thread {} of group {} (files {})",
                st.tid, st.tgid, shared_files
            );
            return self.create(
                st.tid,
                parent,
                Some(leader.group().clone()),
                Some(leader.ns().clone()),
                Some(leader.fdt().fork(shared_files)),
                Some(leader.fs().fork(shared_fs)),
                Some(&st.nspid),
            );
        }

        if st.ppid <= 0 {
            return Err(Error::NotInSandbox(st.tid));
        }
        let parent = self.register_lazy(st.ppid, depth + 1)?;

        // reconstruct the clone flags the kernel already acted on
        let new_pid_ns = !probe::same_pid_ns(parent.tid(), st.tid)?;
        let shared_files = probe::same_files(parent.tid(), st.tid).unwrap_or(false);
        let shared_fs = probe::same_fs(parent.tid(), st.tid).unwrap_or(false);

        debug!(
            target: "supervisor",
            "lazy register tid {} (ppid {}, newpid {}, files {})",
            st.tid, st.ppid, new_pid_ns, shared_files
        );

        let ns = if new_pid_ns {
            None
        } else {
            Some(parent.ns().clone())
        };
        let fdt = parent.fdt().fork(shared_files);
        let fs = parent.fs().fork(shared_fs);
        self.create(
            st.tid,
            Some(parent),
            None,
            ns,
            Some(fdt),
            Some(fs),
            Some(&st.nspid),
        )
    }

    /// Scans /proc for sandbox threads the kernel spawned that we have not
    /// seen a syscall from yet.
    pub fn sync_new_threads(&mut self) {
        let Ok(entries) = fs::read_dir("/proc") else {
            return;
        };
        let mut candidates: Vec<i32> = Vec::new();
        for entry in entries.flatten() {
            if let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            {
                candidates.push(pid);
            }
        }
        for pid in candidates {
            if self.map.contains_key(&pid) {
                // known process: pick up new threads in its group
                self.sync_tasks_of(pid);
            } else if self.chain_reaches_sandbox(pid) {
                let _ = self.register_lazy(pid, 0);
            }
        }
    }

    /// Cheap ancestry test before a full probe: walk PPid links and see
    /// whether they land on a registered tid.
    fn chain_reaches_sandbox(&self, tid: i32) -> bool {
        let mut cur = tid;
        for _ in 0..MAX_CHAIN_WALK {
            let Ok(st) = probe::task_status(cur) else {
                return false;
            };
            if st.ppid <= 0 {
                return false;
            }
            if self.map.contains_key(&st.ppid) {
                return true;
            }
            cur = st.ppid;
        }
        false
    }

    fn sync_tasks_of(&mut self, pid: i32) {
        let Ok(entries) = fs::read_dir(format!("/proc/{}/task", pid)) else {
            return;
        };
        for entry in entries.flatten() {
            if let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            {
                if !self.map.contains_key(&tid) {
                    let _ = self.register_lazy(tid, 0);
                }
            }
        }
    }

    fn collect_post_order(&self, tid: i32, out: &mut Vec<i32>) {
        if let Some(t) = self.map.get(&tid) {
            for child in t.children() {
                self.collect_post_order(child, out);
            }
            out.push(tid);
        }
    }

    /// Deinitializes `tid` and every descendant, children-first so each
    /// namespace root dies after its own subtree.
    pub fn exit(&mut self, tid: i32) {
        let mut order = Vec::new();
        self.collect_post_order(tid, &mut order);
        for t in order {
            if let Some(thread) = self.map.remove(&t) {
                thread.ns().unregister(t);
                thread.group().remove(t);
                if let Some(parent) = thread.parent().and_then(|p| self.map.get(&p)) {
                    parent.remove_child(t);
                }
                // CLONE_FILES sharers keep the table; the last one out
                // releases the open files
                if Arc::strong_count(thread.fdt()) == 1 {
                    thread.fdt().clear();
                }
                debug!(target: "supervisor", "thread {} exited", t);
            }
        }
    }

    /// exit_group: every member of the caller's thread group goes down,
    /// cascading through descendants.
    pub fn exit_group(&mut self, tid: i32) {
        let Some(thread) = self.get(tid) else {
            return;
        };
        for member in thread.group().members() {
            self.exit(member);
        }
    }

    /// Whether `caller` can address `target_tid`: the target must be
    /// registered in the caller's namespace.
    pub fn can_see(&self, caller: &Thread, target_tid: i32) -> bool {
        caller.ns().contains(target_tid)
    }

    /// The caller's pid as the guest should see it: the group leader's
    /// NsTid in the caller's namespace.
    pub fn nstgid(&self, thread: &Thread) -> i32 {
        let leader = thread.group().leader();
        thread
            .ns()
            .nstid_of(leader)
            .expect("thread group leader not visible in its member's namespace")
    }

    /// PPid as seen from `thread`'s own namespace.
    pub fn nsptgid(&self, thread: &Thread) -> i32 {
        self.nsptgid_in(thread, thread.ns())
    }

    /// The parent thread-group leader's NsTid in `ns`, or 0 when the parent
    /// is not visible there (it lives in a strictly outer namespace).
    pub fn nsptgid_in(&self, target: &Thread, ns: &Arc<Namespace>) -> i32 {
        let leader_tid = target.group().leader();
        let leader = match self.get(leader_tid) {
            Some(l) => l,
            None => return 0,
        };
        let parent = match leader.parent().and_then(|p| self.get(p)) {
            Some(p) => p,
            None => return 0,
        };
        ns.nstid_of(parent.group().leader()).unwrap_or(0)
    }
}

const MAX_CHAIN_WALK: usize = 512;
