//! Process-identity and lifecycle handlers.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::debug;

use crate::error::{Error, Result};
use crate::notif::{Notification, Reply};
use crate::supervisor::Supervisor;

/// The caller's pid: its group leader's NsTid in its own namespace.
pub async fn getpid(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    Ok(Reply::Value(i64::from(state.threads.nstgid(&caller))))
}

/// The parent group leader's NsTid, or 0 when the parent is invisible from
/// the caller's namespace.
pub async fn getppid(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    Ok(Reply::Value(i64::from(state.threads.nsptgid(&caller))))
}

pub async fn gettid(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let nstid = caller
        .ns()
        .nstid_of(n.tid)
        .expect("caller not registered in its own namespace");
    Ok(Reply::Value(i64::from(nstid)))
}

fn parse_signal(raw: i32) -> Result<Option<Signal>> {
    if raw == 0 {
        // existence probe
        return Ok(None);
    }
    Signal::try_from(raw)
        .map(Some)
        .map_err(|_| Error::Os(Errno::EINVAL))
}

/// kill resolves the target in the caller's namespace and requires
/// visibility; process groups and broadcast are out of scope, so
/// non-positive pids are EINVAL.
pub async fn kill(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let target_pid = n.args[0] as i32;
    let sig = parse_signal(n.args[1] as i32)?;
    if target_pid <= 0 {
        return Err(Error::Os(Errno::EINVAL));
    }

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let abs = caller
        .ns()
        .abs_of(target_pid)
        .ok_or(Error::Os(Errno::ESRCH))?;
    if !state.threads.can_see(&caller, abs) {
        return Err(Error::Os(Errno::ESRCH));
    }
    state.threads.lookup(abs).map_err(|_| Error::Os(Errno::ESRCH))?;

    debug!(target: "supervisor", "kill {} -> abs {} sig {:?}", target_pid, abs, sig);
    nix::sys::signal::kill(Pid::from_raw(abs), sig)?;
    Ok(Reply::Value(0))
}

/// tkill cleans the target out of the registry, then lets the kernel
/// deliver the signal for real.
pub async fn tkill(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let target_tid = n.args[0] as i32;
    parse_signal(n.args[1] as i32)?;
    if target_tid <= 0 {
        return Err(Error::Os(Errno::EINVAL));
    }

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let abs = caller
        .ns()
        .abs_of(target_tid)
        .ok_or(Error::Os(Errno::ESRCH))?;
    if !state.threads.can_see(&caller, abs) {
        return Err(Error::Os(Errno::ESRCH));
    }
    state.threads.exit(abs);
    Ok(Reply::Continue)
}

/// Deinitialize the caller before the kernel actually terminates it.
pub async fn exit(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    state.threads.exit(n.tid);
    Ok(Reply::Continue)
}

pub async fn exit_group(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    state.threads.exit_group(n.tid);
    Ok(Reply::Continue)
}
