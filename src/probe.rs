//! Recovers thread facts from kernel state.
//!
//! The supervisor never intercepts clone completion; when a notification
//! arrives from an unknown tid, this probe reads `/proc/[tid]/status` for
//! (tgid, ppid, NSpid chain), compares pid-namespace identity via
//! `/proc/[tid]/ns/pid`, and compares fd-table / fs identity via kcmp(2).

use std::fs;

use nix::errno::Errno;

use crate::err;
use crate::error::{Error, Result};

pub const MAX_NS_DEPTH: usize = 128;

// linux/kcmp.h
const KCMP_FILES: i32 = 2;
const KCMP_FS: i32 = 3;

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub tid: i32,
    pub tgid: i32,
    pub ppid: i32,
    /// Outermost to innermost.
    pub nspid: Vec<i32>,
}

pub fn task_status(tid: i32) -> Result<TaskStatus> {
    let text = fs::read_to_string(format!("/proc/{}/status", tid))
        .map_err(|_| Error::NotInSandbox(tid))?;
    parse_status(tid, &text)
}

fn parse_status(tid: i32, text: &str) -> Result<TaskStatus> {
    let mut tgid = None;
    let mut ppid = None;
    let mut nspid = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Tgid:") {
            tgid = rest.trim().parse::<i32>().ok();
        } else if let Some(rest) = line.strip_prefix("PPid:") {
            ppid = rest.trim().parse::<i32>().ok();
        } else if let Some(rest) = line.strip_prefix("NSpid:") {
            for tok in rest.split_whitespace() {
                nspid.push(tok.parse::<i32>().map_err(|_| Error::Parse("NSpid"))?);
            }
        }
    }

    if nspid.is_empty() {
        // pre-4.1 kernels have no NSpid line
        nspid.push(tid);
    }
    if nspid.len() > MAX_NS_DEPTH {
        return Err(Error::Parse("NSpid chain too deep"));
    }

    Ok(TaskStatus {
        tid,
        tgid: tgid.ok_or(Error::Parse("Tgid"))?,
        ppid: ppid.ok_or(Error::Parse("PPid"))?,
        nspid,
    })
}

/// The pid-namespace identity (inode) of a thread.
pub fn pid_ns_id(tid: i32) -> Result<u64> {
    let link = fs::read_link(format!("/proc/{}/ns/pid", tid))
        .map_err(|_| Error::NotInSandbox(tid))?;
    let s = link.to_string_lossy();
    // "pid:[4026531836]"
    let inner = s
        .strip_prefix("pid:[")
        .and_then(|r| r.strip_suffix(']'))
        .ok_or(Error::Parse("ns link"))?;
    inner.parse::<u64>().map_err(|_| Error::Parse("ns inode"))
}

pub fn same_pid_ns(a: i32, b: i32) -> Result<bool> {
    Ok(pid_ns_id(a)? == pid_ns_id(b)?)
}

fn kcmp(a: i32, b: i32, what: i32) -> Result<bool> {
    let ret = err(|| unsafe { libc::syscall(libc::SYS_kcmp, a, b, what, 0u64, 0u64) } as i64)
        .map_err(|e| match e {
            Errno::ESRCH => Error::NotInSandbox(b),
            other => Error::Os(other),
        })?;
    Ok(ret == 0)
}

/// kcmp "equal" on the file descriptor tables of two threads.
pub fn same_files(a: i32, b: i32) -> Result<bool> {
    kcmp(a, b, KCMP_FILES)
}

/// kcmp "equal" on fs_struct (cwd/root/umask sharing).
pub fn same_fs(a: i32, b: i32) -> Result<bool> {
    kcmp(a, b, KCMP_FS)
}
