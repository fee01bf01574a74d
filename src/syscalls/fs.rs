//! Filesystem handlers: open/close, stat, cwd, directory ops, execve.

use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::debug;

use crate::error::{Error, Result};
use crate::file::{File, Statx};
use crate::guestmem;
use crate::notif::{Notification, Reply};
use crate::proc::{self, ProcTarget};
use crate::router::{self, Route};
use crate::supervisor::{State, Supervisor};
use crate::task::Thread;

use super::{resolve_path_arg, write_struct, STAGE_MAX};

fn open_proc_file(
    state: &mut State,
    caller: &Arc<Thread>,
    path: &str,
    flags: i32,
) -> Result<Arc<File>> {
    if flags & libc::O_ACCMODE != libc::O_RDONLY {
        return Err(Error::Os(Errno::EACCES));
    }
    let target = proc::parse(path)?;

    // pick up threads the kernel spawned that we have not heard from yet
    if matches!(
        target,
        ProcTarget::PidDir(_) | ProcTarget::Status(_) | ProcTarget::Root
    ) {
        state.threads.sync_new_threads();
    }

    let file = match target {
        ProcTarget::Root => File::proc_dir(
            "/proc".to_string(),
            proc::root_ino(),
            proc::root_dirents(caller),
        ),
        ProcTarget::SelfDir | ProcTarget::PidDir(_) => {
            let nstgid = proc::resolve_nstgid(&state.threads, caller, target)?;
            File::proc_dir(
                format!("/proc/{}", nstgid),
                proc::pid_dir_ino(nstgid),
                proc::pid_dirents(nstgid),
            )
        }
        ProcTarget::SelfStatus | ProcTarget::Status(_) => {
            if flags & libc::O_DIRECTORY != 0 {
                return Err(Error::Os(Errno::ENOTDIR));
            }
            let nstgid = proc::resolve_nstgid(&state.threads, caller, target)?;
            // snapshot semantics: content frozen now, at open
            let content = proc::status_content(&state.threads, caller, nstgid)?;
            File::proc_file(
                format!("/proc/{}/status", nstgid),
                proc::status_ino(nstgid),
                content,
            )
        }
    };
    Ok(file)
}

pub async fn openat(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let dirfd = n.args[0] as i32;
    let flags = n.args[2] as i32;
    let mode = n.args[3] as u32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let path = resolve_path_arg(state, &caller, n.tid, dirfd, n.args[1])?;

    let file = match router::resolve_normalized(&path) {
        Route::Block => return Err(Error::Os(Errno::EPERM)),
        Route::Proc => open_proc_file(state, &caller, &path, flags)?,
        Route::Device => File::open_passthrough(&path, flags, mode)?,
        route @ (Route::Tmp | Route::Cow) => {
            if state.tombstones.contains(&path) {
                if flags & libc::O_CREAT == 0 {
                    return Err(Error::Os(Errno::ENOENT));
                }
                // creation resurrects the path
                state.tombstones.remove(&path);
            }
            match route {
                Route::Tmp => File::open_tmp(&state.overlay, &path, flags, mode)?,
                _ => File::open_cow(&state.overlay, &path, flags, mode)?,
            }
        }
    };

    let vfd = caller.fdt().insert(file, flags & libc::O_CLOEXEC != 0);
    debug!(target: "guest", "tid {} openat {} -> vfd {}", n.tid, path, vfd);
    Ok(Reply::Value(i64::from(vfd)))
}

pub async fn close(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if (0..=2).contains(&fd) {
        return Ok(Reply::Continue);
    }
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let file = caller.fdt().remove(fd).ok_or(Error::Os(Errno::EBADF))?;
    crate::fdtable::release(file);
    Ok(Reply::Value(0))
}

/// Stat of a path through the guest's view: overlay first, tombstones
/// honored, /proc synthesized.
fn stat_path(state: &mut State, caller: &Arc<Thread>, path: &str) -> Result<Statx> {
    match router::resolve_normalized(path) {
        Route::Block => Err(Error::Os(Errno::EPERM)),
        Route::Device => {
            let st = nix::sys::stat::stat(Path::new(path))?;
            Ok(Statx::from_stat(&st))
        }
        Route::Proc => {
            let target = proc::parse(path)?;
            state.threads.sync_new_threads();
            match target {
                ProcTarget::Root => Ok(Statx {
                    mode: libc::S_IFDIR | 0o555,
                    nlink: 2,
                    ino: proc::root_ino(),
                    blksize: 4096,
                    ..Default::default()
                }),
                ProcTarget::SelfDir | ProcTarget::PidDir(_) => {
                    let nstgid = proc::resolve_nstgid(&state.threads, caller, target)?;
                    Ok(Statx {
                        mode: libc::S_IFDIR | 0o555,
                        nlink: 2,
                        ino: proc::pid_dir_ino(nstgid),
                        blksize: 4096,
                        ..Default::default()
                    })
                }
                ProcTarget::SelfStatus | ProcTarget::Status(_) => {
                    let nstgid = proc::resolve_nstgid(&state.threads, caller, target)?;
                    let content = proc::status_content(&state.threads, caller, nstgid)?;
                    Ok(Statx {
                        mode: libc::S_IFREG | 0o444,
                        nlink: 1,
                        size: content.len() as u64,
                        ino: proc::status_ino(nstgid),
                        blksize: 4096,
                        ..Default::default()
                    })
                }
            }
        }
        Route::Tmp => {
            if path == "/tmp" {
                let st = nix::sys::stat::stat(&state.overlay.resolve_tmp("/tmp")?)?;
                return Ok(Statx::from_stat(&st));
            }
            let real = state.overlay.resolve_tmp(path)?;
            let st = nix::sys::stat::stat(&real)?;
            Ok(Statx::from_stat(&st))
        }
        Route::Cow => {
            if state.tombstones.contains(path) {
                return Err(Error::Os(Errno::ENOENT));
            }
            let real = if state.overlay.cow_exists(path) {
                state.overlay.resolve_cow(path)
            } else {
                Path::new(path).to_path_buf()
            };
            let st = nix::sys::stat::stat(&real)?;
            Ok(Statx::from_stat(&st))
        }
    }
}

pub async fn fstat(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if (0..=2).contains(&fd) {
        return Ok(Reply::Continue);
    }
    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let st = file.statx()?.to_stat();
    write_struct(n.tid, n.args[1], &st)?;
    Ok(Reply::Value(0))
}

pub async fn fstatat(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let dirfd = n.args[0] as i32;
    let at_flags = n.args[3] as i32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;

    let stx = if at_flags & libc::AT_EMPTY_PATH != 0 {
        caller.fdt().lookup(dirfd)?.statx()?
    } else {
        let path = resolve_path_arg(state, &caller, n.tid, dirfd, n.args[1])?;
        stat_path(state, &caller, &path)?
    };
    write_struct(n.tid, n.args[2], &stx.to_stat())?;
    Ok(Reply::Value(0))
}

pub async fn statx(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let dirfd = n.args[0] as i32;
    let at_flags = n.args[2] as i32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;

    let stx = if at_flags & libc::AT_EMPTY_PATH != 0 {
        caller.fdt().lookup(dirfd)?.statx()?
    } else {
        let path = resolve_path_arg(state, &caller, n.tid, dirfd, n.args[1])?;
        stat_path(state, &caller, &path)?
    };
    write_struct(n.tid, n.args[4], &stx.to_statx())?;
    Ok(Reply::Value(0))
}

pub async fn lseek(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    if (0..=2).contains(&fd) {
        return Ok(Reply::Continue);
    }
    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let pos = file.lseek(n.args[1] as i64, n.args[2] as i32)?;
    Ok(Reply::Value(pos))
}

pub async fn getcwd(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let size = n.args[1] as usize;
    let cwd = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fs().cwd()
    };
    let bytes = cwd.as_bytes();
    if bytes.len() + 1 > size {
        return Err(Error::Os(Errno::ERANGE));
    }
    let mut out = bytes.to_vec();
    out.push(0);
    guestmem::write_all(n.tid, n.args[0], &out)?;
    Ok(Reply::Value(out.len() as i64))
}

/// The target must be a directory the guest can see.
fn check_guest_dir(state: &mut State, caller: &Arc<Thread>, path: &str) -> Result<()> {
    match router::resolve_normalized(path) {
        Route::Block => Err(Error::Os(Errno::EPERM)),
        Route::Proc => match proc::parse(path)? {
            ProcTarget::Root => Ok(()),
            t @ (ProcTarget::SelfDir | ProcTarget::PidDir(_)) => {
                proc::resolve_nstgid(&state.threads, caller, t)?;
                Ok(())
            }
            _ => Err(Error::Os(Errno::ENOTDIR)),
        },
        Route::Device => Err(Error::Os(Errno::ENOTDIR)),
        Route::Tmp => {
            if path == "/tmp" {
                return Ok(());
            }
            let real = state.overlay.resolve_tmp(path)?;
            match real.metadata() {
                Ok(m) if m.is_dir() => Ok(()),
                Ok(_) => Err(Error::Os(Errno::ENOTDIR)),
                Err(_) => Err(Error::Os(Errno::ENOENT)),
            }
        }
        Route::Cow => {
            if state.tombstones.contains(path) {
                return Err(Error::Os(Errno::ENOENT));
            }
            if state.overlay.is_guest_dir(path) {
                Ok(())
            } else if state.overlay.cow_exists(path) || Path::new(path).exists() {
                Err(Error::Os(Errno::ENOTDIR))
            } else {
                Err(Error::Os(Errno::ENOENT))
            }
        }
    }
}

pub async fn chdir(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let path = resolve_path_arg(state, &caller, n.tid, libc::AT_FDCWD, n.args[0])?;
    check_guest_dir(state, &caller, &path)?;
    caller.fs().set_cwd(path);
    Ok(Reply::Value(0))
}

pub async fn fchdir(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let file = caller.fdt().lookup(fd)?;
    if !file.is_dir() {
        return Err(Error::Os(Errno::ENOTDIR));
    }
    let path = file
        .guest_path()
        .ok_or(Error::Os(Errno::ENOTDIR))?
        .to_string();
    caller.fs().set_cwd(path);
    Ok(Reply::Value(0))
}

pub async fn faccessat(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let dirfd = n.args[0] as i32;
    let mode = n.args[2] as i32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let path = resolve_path_arg(state, &caller, n.tid, dirfd, n.args[1])?;

    match router::resolve_normalized(&path) {
        Route::Block => Err(Error::Os(Errno::EPERM)),
        Route::Proc => {
            if mode & libc::W_OK != 0 {
                return Err(Error::Os(Errno::EACCES));
            }
            // existence in the virtual view is the whole check
            stat_path(state, &caller, &path)?;
            Ok(Reply::Value(0))
        }
        Route::Device | Route::Tmp | Route::Cow => {
            stat_path(state, &caller, &path)?;
            Ok(Reply::Value(0))
        }
    }
}

pub async fn fcntl(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let cmd = n.args[1] as i32;
    if (0..=2).contains(&fd) {
        return Ok(Reply::Continue);
    }

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    match cmd {
        libc::F_GETFL => {
            let file = caller.fdt().lookup(fd)?;
            Ok(Reply::Value(i64::from(file.getfl()?)))
        }
        libc::F_GETFD => {
            let cloexec = caller.fdt().cloexec(fd)?;
            Ok(Reply::Value(if cloexec { libc::FD_CLOEXEC as i64 } else { 0 }))
        }
        libc::F_SETFD => {
            let cloexec = n.args[2] as i32 & libc::FD_CLOEXEC != 0;
            caller.fdt().set_cloexec(fd, cloexec)?;
            Ok(Reply::Value(0))
        }
        _ => Err(Error::Os(Errno::EINVAL)),
    }
}

pub async fn dup(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let newfd = caller.fdt().dup(n.args[0] as i32)?;
    Ok(Reply::Value(i64::from(newfd)))
}

pub async fn dup3(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let flags = n.args[2] as i32;
    if flags & !libc::O_CLOEXEC != 0 {
        return Err(Error::Os(Errno::EINVAL));
    }
    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let newfd = caller.fdt().dup3(
        n.args[0] as i32,
        n.args[1] as i32,
        flags & libc::O_CLOEXEC != 0,
    )?;
    Ok(Reply::Value(i64::from(newfd)))
}

pub async fn getdents64(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let fd = n.args[0] as i32;
    let count = n.args[2] as usize;
    let file = {
        let state = &mut *sup.state.lock().await;
        let caller = state.threads.lookup_or_register(n.tid)?;
        caller.fdt().lookup(fd)?
    };
    let mut stage = vec![0u8; count.min(STAGE_MAX)];
    let nread = file.getdents64(&mut stage)?;
    guestmem::write_all(n.tid, n.args[1], &stage[..nread])?;
    Ok(Reply::Value(nread as i64))
}

pub async fn unlinkat(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let dirfd = n.args[0] as i32;
    let flags = n.args[2] as i32;
    let rmdir = flags & libc::AT_REMOVEDIR != 0;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let path = resolve_path_arg(state, &caller, n.tid, dirfd, n.args[1])?;

    match router::resolve_normalized(&path) {
        Route::Block | Route::Device | Route::Proc => Err(Error::Os(Errno::EPERM)),
        Route::Tmp => {
            let real = state.overlay.resolve_tmp(&path)?;
            let meta = real
                .symlink_metadata()
                .map_err(|_| Error::Os(Errno::ENOENT))?;
            match (rmdir, meta.is_dir()) {
                (true, false) => Err(Error::Os(Errno::ENOTDIR)),
                (false, true) => Err(Error::Os(Errno::EISDIR)),
                (true, true) => {
                    std::fs::remove_dir(&real)?;
                    Ok(Reply::Value(0))
                }
                (false, false) => {
                    std::fs::remove_file(&real)?;
                    Ok(Reply::Value(0))
                }
            }
        }
        Route::Cow => {
            if state.tombstones.contains(&path) {
                return Err(Error::Os(Errno::ENOENT));
            }
            let host_exists = Path::new(&path).symlink_metadata().is_ok();
            let cow_exists = state.overlay.cow_exists(&path);
            if !host_exists && !cow_exists {
                return Err(Error::Os(Errno::ENOENT));
            }
            let is_dir = state.overlay.is_guest_dir(&path);
            if rmdir && !is_dir {
                return Err(Error::Os(Errno::ENOTDIR));
            }
            if !rmdir && is_dir {
                return Err(Error::Os(Errno::EISDIR));
            }
            if cow_exists {
                let real = state.overlay.resolve_cow(&path);
                if is_dir {
                    std::fs::remove_dir_all(&real)?;
                } else {
                    std::fs::remove_file(&real)?;
                }
            }
            // hide the host path even though it still exists there
            state.tombstones.insert(
                &path,
                if is_dir {
                    crate::tombstone::TombKind::Dir
                } else {
                    crate::tombstone::TombKind::File
                },
            );
            Ok(Reply::Value(0))
        }
    }
}

pub async fn mkdirat(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let dirfd = n.args[0] as i32;

    let state = &mut *sup.state.lock().await;
    let caller = state.threads.lookup_or_register(n.tid)?;
    let path = resolve_path_arg(state, &caller, n.tid, dirfd, n.args[1])?;

    match router::resolve_normalized(&path) {
        Route::Block | Route::Device | Route::Proc => Err(Error::Os(Errno::EPERM)),
        Route::Tmp => {
            let real = state.overlay.resolve_tmp(&path)?;
            if real.symlink_metadata().is_ok() {
                return Err(Error::Os(Errno::EEXIST));
            }
            if let Some(parent) = real.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::create_dir(&real)?;
            Ok(Reply::Value(0))
        }
        Route::Cow => {
            let tombstoned = state.tombstones.contains(&path);
            let visible = !tombstoned
                && (state.overlay.cow_exists(&path) || Path::new(&path).symlink_metadata().is_ok());
            if visible {
                return Err(Error::Os(Errno::EEXIST));
            }
            state.overlay.create_cow_parent_dirs(&path)?;
            std::fs::create_dir(state.overlay.resolve_cow(&path))?;
            state.tombstones.remove(&path);
            Ok(Reply::Value(0))
        }
    }
}

/// execve routes the program path; COW'd or /tmp programs are rewritten in
/// place to a pooled symlink into the overlay, then the kernel runs the
/// exec itself.
pub async fn execve(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let state = &mut *sup.state.lock().await;
    state.threads.lookup_or_register(n.tid)?;

    let raw = guestmem::read_cstring(n.tid, n.args[0])?;
    let raw_len = raw.len();
    let s = std::str::from_utf8(&raw).map_err(|_| Error::InvalidPath)?;
    if !s.starts_with('/') {
        return Err(Error::Os(Errno::EACCES));
    }
    let path = router::normalize(s)?;

    let target = match router::resolve_normalized(&path) {
        Route::Block => return Err(Error::Os(Errno::EPERM)),
        Route::Proc => return Err(Error::Os(Errno::EACCES)),
        Route::Device => return Ok(Reply::Continue),
        Route::Cow => {
            if state.tombstones.contains(&path) {
                return Err(Error::Os(Errno::ENOENT));
            }
            if !state.overlay.cow_exists(&path) {
                // untouched host binary: nothing to rewrite
                return Ok(Reply::Continue);
            }
            state.overlay.resolve_cow(&path)
        }
        Route::Tmp => {
            if !state.overlay.tmp_exists(&path) {
                return Err(Error::Os(Errno::ENOENT));
            }
            state.overlay.resolve_tmp(&path)?
        }
    };

    let link = state.symlinks.alloc(&target)?;
    let link_str = link.to_str().ok_or(Error::InvalidPath)?;
    // the rewrite happens in place in guest memory, bounded by what the
    // guest allotted for its own string
    if link_str.len() > raw_len {
        state.symlinks.release(&link);
        return Err(Error::BufferTooSmall);
    }
    let mut bytes = link_str.as_bytes().to_vec();
    bytes.push(0);
    guestmem::write_all(n.tid, n.args[0], &bytes)?;
    debug!(target: "guest", "tid {} execve {} via {}", n.tid, path, link_str);
    Ok(Reply::Continue)
}
