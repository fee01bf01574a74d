//! Syscall dispatch.
//!
//! A static table maps each syscall number to a dedicated handler, CONTINUE
//! (the kernel runs it unchanged), PERM (hard-blocked) or NOSYS. Unknown
//! numbers are NOSYS. Handlers parse arguments out of guest memory, mutate
//! supervisor state under its lock, perform host I/O through file backends,
//! and produce exactly one reply.

mod fs;
mod io;
mod net;
mod process;
mod sys;

use nix::errno::Errno;
use tracing::{info, trace};

use crate::error::{Error, Result};
use crate::guestmem;
use crate::notif::{Notification, Reply};
use crate::router;
use crate::supervisor::{State, Supervisor};
use crate::task::Thread;

/// Scatter/gather staging buffer bound; larger transfers complete short.
pub(crate) const STAGE_MAX: usize = 4096;
/// iovec arrays are truncated to this many entries.
pub(crate) const IOV_MAX_HANDLED: usize = 16;

enum Action {
    Handler,
    Continue,
    Perm,
    Nosys,
}

fn classify(nr: i64) -> Action {
    match nr {
        // virtualized
        libc::SYS_getpid
        | libc::SYS_getppid
        | libc::SYS_gettid
        | libc::SYS_openat
        | libc::SYS_close
        | libc::SYS_read
        | libc::SYS_write
        | libc::SYS_readv
        | libc::SYS_writev
        | libc::SYS_dup
        | libc::SYS_dup3
        | libc::SYS_pipe2
        | libc::SYS_eventfd2
        | libc::SYS_fstat
        | libc::SYS_newfstatat
        | libc::SYS_statx
        | libc::SYS_lseek
        | libc::SYS_getcwd
        | libc::SYS_chdir
        | libc::SYS_fchdir
        | libc::SYS_faccessat
        | libc::SYS_fcntl
        | libc::SYS_ioctl
        | libc::SYS_getdents64
        | libc::SYS_unlinkat
        | libc::SYS_mkdirat
        | libc::SYS_socket
        | libc::SYS_socketpair
        | libc::SYS_connect
        | libc::SYS_shutdown
        | libc::SYS_sendto
        | libc::SYS_recvfrom
        | libc::SYS_sendmsg
        | libc::SYS_recvmsg
        | libc::SYS_uname
        | libc::SYS_sysinfo
        | libc::SYS_kill
        | libc::SYS_tkill
        | libc::SYS_exit
        | libc::SYS_exit_group
        | libc::SYS_execve => Action::Handler,

        // passthrough: memory, signals, timing, scheduling, identity
        libc::SYS_brk
        | libc::SYS_mmap
        | libc::SYS_munmap
        | libc::SYS_mprotect
        | libc::SYS_mremap
        | libc::SYS_madvise
        | libc::SYS_membarrier
        | libc::SYS_rt_sigaction
        | libc::SYS_rt_sigprocmask
        | libc::SYS_rt_sigreturn
        | libc::SYS_sigaltstack
        | libc::SYS_futex
        | libc::SYS_nanosleep
        | libc::SYS_clock_gettime
        | libc::SYS_clock_getres
        | libc::SYS_clock_nanosleep
        | libc::SYS_gettimeofday
        | libc::SYS_getrandom
        | libc::SYS_sched_yield
        | libc::SYS_sched_getaffinity
        | libc::SYS_getuid
        | libc::SYS_geteuid
        | libc::SYS_getgid
        | libc::SYS_getegid
        | libc::SYS_getgroups
        | libc::SYS_getpgid
        | libc::SYS_clone
        | libc::SYS_clone3
        | libc::SYS_wait4
        | libc::SYS_waitid
        | libc::SYS_set_tid_address
        | libc::SYS_set_robust_list
        | libc::SYS_rseq
        | libc::SYS_umask
        | libc::SYS_fsync
        | libc::SYS_fdatasync => Action::Continue,

        // hard-blocked
        libc::SYS_ptrace
        | libc::SYS_mount
        | libc::SYS_umount2
        | libc::SYS_chroot
        | libc::SYS_pivot_root
        | libc::SYS_setns
        | libc::SYS_unshare
        | libc::SYS_seccomp
        | libc::SYS_bpf
        | libc::SYS_kexec_load
        | libc::SYS_kexec_file_load
        | libc::SYS_init_module
        | libc::SYS_finit_module
        | libc::SYS_delete_module
        | libc::SYS_prlimit64
        | libc::SYS_personality
        | libc::SYS_reboot
        | libc::SYS_swapon
        | libc::SYS_swapoff => Action::Perm,

        _ => Action::Nosys,
    }
}

pub async fn handle(sup: &Supervisor, n: Notification) -> Reply {
    let nr = i64::from(n.nr);
    match classify(nr) {
        Action::Continue => Reply::Continue,
        Action::Perm => {
            info!(target: "guest", "tid {} blocked syscall {}", n.tid, nr);
            Reply::Failure(Errno::EPERM)
        }
        Action::Nosys => {
            info!(target: "guest", "tid {} unimplemented syscall {}", n.tid, nr);
            Reply::Failure(Errno::ENOSYS)
        }
        Action::Handler => match dispatch(sup, &n).await {
            Ok(reply) => reply,
            Err(e) => {
                // guest-originated failures are ordinary errnos, never fatal
                info!(
                    target: "guest",
                    "tid {} syscall {} failed: {}", n.tid, nr, e
                );
                Reply::Failure(e.errno())
            }
        },
    }
}

async fn dispatch(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    let nr = i64::from(n.nr);
    trace!(target: "guest", "dispatch tid {} nr {}", n.tid, nr);
    match nr {
        libc::SYS_getpid => process::getpid(sup, n).await,
        libc::SYS_getppid => process::getppid(sup, n).await,
        libc::SYS_gettid => process::gettid(sup, n).await,
        libc::SYS_kill => process::kill(sup, n).await,
        libc::SYS_tkill => process::tkill(sup, n).await,
        libc::SYS_exit => process::exit(sup, n).await,
        libc::SYS_exit_group => process::exit_group(sup, n).await,

        libc::SYS_openat => fs::openat(sup, n).await,
        libc::SYS_close => fs::close(sup, n).await,
        libc::SYS_fstat => fs::fstat(sup, n).await,
        libc::SYS_newfstatat => fs::fstatat(sup, n).await,
        libc::SYS_statx => fs::statx(sup, n).await,
        libc::SYS_lseek => fs::lseek(sup, n).await,
        libc::SYS_getcwd => fs::getcwd(sup, n).await,
        libc::SYS_chdir => fs::chdir(sup, n).await,
        libc::SYS_fchdir => fs::fchdir(sup, n).await,
        libc::SYS_faccessat => fs::faccessat(sup, n).await,
        libc::SYS_fcntl => fs::fcntl(sup, n).await,
        libc::SYS_dup => fs::dup(sup, n).await,
        libc::SYS_dup3 => fs::dup3(sup, n).await,
        libc::SYS_getdents64 => fs::getdents64(sup, n).await,
        libc::SYS_unlinkat => fs::unlinkat(sup, n).await,
        libc::SYS_mkdirat => fs::mkdirat(sup, n).await,
        libc::SYS_execve => fs::execve(sup, n).await,

        libc::SYS_read => io::read(sup, n).await,
        libc::SYS_write => io::write(sup, n).await,
        libc::SYS_readv => io::readv(sup, n).await,
        libc::SYS_writev => io::writev(sup, n).await,
        libc::SYS_pipe2 => io::pipe2(sup, n).await,
        libc::SYS_eventfd2 => io::eventfd2(sup, n).await,

        libc::SYS_ioctl => net::ioctl(sup, n).await,
        libc::SYS_socket => net::socket(sup, n).await,
        libc::SYS_socketpair => net::socketpair(sup, n).await,
        libc::SYS_connect => net::connect(sup, n).await,
        libc::SYS_shutdown => net::shutdown(sup, n).await,
        libc::SYS_sendto => net::sendto(sup, n).await,
        libc::SYS_recvfrom => net::recvfrom(sup, n).await,
        libc::SYS_sendmsg => net::sendmsg(sup, n).await,
        libc::SYS_recvmsg => net::recvmsg(sup, n).await,

        libc::SYS_uname => sys::uname(sup, n).await,
        libc::SYS_sysinfo => sys::sysinfo(sup, n).await,

        _ => Err(Error::Os(Errno::ENOSYS)),
    }
}

/// Reads a path argument out of guest memory and normalizes it. Relative
/// paths resolve against the caller's cwd (AT_FDCWD) or the directory the
/// dirfd was opened under.
pub(crate) fn resolve_path_arg(
    state: &State,
    caller: &Thread,
    tid: i32,
    dirfd: i32,
    addr: u64,
) -> Result<String> {
    let raw = guestmem::read_cstring(tid, addr)?;
    let s = std::str::from_utf8(&raw).map_err(|_| Error::InvalidPath)?;
    if s.is_empty() {
        return Err(Error::InvalidPath);
    }
    if s.starts_with('/') {
        return router::normalize(s);
    }
    let base = if dirfd == libc::AT_FDCWD {
        caller.fs().cwd()
    } else {
        let file = caller.fdt().lookup(dirfd)?;
        match file.guest_path() {
            Some(p) => p.to_string(),
            None => return Err(Error::Os(Errno::ENOTDIR)),
        }
    };
    router::normalize(&format!("{}/{}", base, s))
}

pub(crate) fn write_struct<T>(tid: i32, addr: u64, val: &T) -> Result<()> {
    let bytes = unsafe {
        std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
    };
    guestmem::write_all(tid, addr, bytes)
}

pub(crate) fn read_struct<T: Copy>(tid: i32, addr: u64) -> Result<T> {
    let mut val: T = unsafe { std::mem::zeroed() };
    let bytes = unsafe {
        std::slice::from_raw_parts_mut(&mut val as *mut T as *mut u8, std::mem::size_of::<T>())
    };
    guestmem::read_exact(tid, addr, bytes)?;
    Ok(val)
}
