//! The supervisor: owns all virtual state and runs the notification loop.
//!
//! A single task reads notifications (the receive ioctl is not safe to call
//! from several workers at once) and fans each one out to a handler task,
//! keeping at most `max_inflight` outstanding. Polling the fd for
//! readability first matters: on some kernels the receive ioctl's internal
//! wait does not observe filter death, while poll correctly reports hangup.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::logging::OutputBuffers;
use crate::notif::{self, Notification, Reply};
use crate::overlay::OverlayRoot;
use crate::pidfd::PidFd;
use crate::symlinks::SymlinkPool;
use crate::syscalls;
use crate::task::Threads;
use crate::tombstone::Tombstones;

/// Everything handlers mutate, behind one coarse lock. Handler I/O runs
/// outside the lock on ref-pinned files; only table updates come back in.
pub struct State {
    pub threads: Threads,
    pub overlay: OverlayRoot,
    pub tombstones: Tombstones,
    pub symlinks: SymlinkPool,
}

pub struct Supervisor {
    cfg: Config,
    notif_fd: AsyncFd<OwnedFd>,
    init_tid: i32,
    pub state: tokio::sync::Mutex<State>,
    pub output: OutputBuffers,
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(new_flags))?;
    Ok(())
}

impl Supervisor {
    pub fn new(cfg: Config, init_tid: i32, notif_fd: OwnedFd) -> anyhow::Result<Arc<Self>> {
        set_nonblocking(notif_fd.as_fd())?;
        let overlay = OverlayRoot::new(&cfg.overlay_base, cfg.sandbox_uid.as_deref())?;
        let symlinks = SymlinkPool::new(&cfg.symlink_root)?;
        info!(
            target: "supervisor",
            "sandbox {} supervising init tid {}", overlay.uid(), init_tid
        );
        Ok(Arc::new(Self {
            notif_fd: AsyncFd::with_interest(notif_fd, Interest::READABLE)?,
            init_tid,
            state: tokio::sync::Mutex::new(State {
                threads: Threads::new(init_tid),
                overlay,
                tombstones: Tombstones::new(),
                symlinks,
            }),
            output: OutputBuffers::new(),
            cfg,
        }))
    }

    /// Steals the guest's notification fd out of its fd table and builds the
    /// supervisor around it. The guest may still be installing the filter,
    /// hence the bounded retry.
    pub async fn connect(
        cfg: Config,
        guest_pid: i32,
        notif_fd_slot: i32,
    ) -> anyhow::Result<Arc<Self>> {
        let pidfd = PidFd::open(guest_pid)?;
        let notif_fd = pidfd
            .get_fd_retry(notif_fd_slot)
            .await
            .map_err(|e| anyhow::anyhow!("fetching notification fd: {}", e))?;
        Self::new(cfg, guest_pid, notif_fd)
    }

    pub fn init_tid(&self) -> i32 {
        self.init_tid
    }

    pub(crate) fn notif_fd(&self) -> BorrowedFd<'_> {
        self.notif_fd.get_ref().as_fd()
    }

    async fn recv_one(&self) -> std::io::Result<Option<Notification>> {
        loop {
            let mut guard = self.notif_fd.readable().await?;
            match notif::recv(self.notif_fd.get_ref().as_fd()) {
                Ok(n) => return Ok(Some(n)),
                Err(Errno::EWOULDBLOCK) => {
                    guard.clear_ready();
                }
                Err(Errno::EINTR) => {}
                Err(Errno::ENOENT) => {
                    // filter is gone: the guest exited
                    return Ok(None);
                }
                Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn reply(&self, id: u64, reply: Reply) {
        match notif::send(self.notif_fd(), id, reply) {
            Ok(()) => {}
            Err(Errno::ENOENT) => {
                // the guest task died while we were handling its syscall
                debug!(target: "supervisor", "reply {}: guest already exited", id);
            }
            Err(e) => warn!(target: "supervisor", "reply {} failed: {}", id, e),
        }
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // honor the in-flight window before accepting more work
            while tasks.len() >= self.cfg.max_inflight {
                if let Some(Err(e)) = tasks.join_next().await {
                    warn!(target: "supervisor", "handler task failed: {}", e);
                }
            }

            let n = match self.recv_one().await {
                Ok(Some(n)) => n,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "supervisor", "notification receive failed: {}", e);
                    break;
                }
            };
            trace!(
                target: "guest",
                "tid {} syscall {} id {:#x}", n.tid, n.nr, n.id
            );

            let sup = self.clone();
            tasks.spawn(async move {
                let reply = syscalls::handle(&sup, n).await;
                sup.reply(n.id, reply);
            });
        }

        // outstanding handlers are awaited, never canceled: ordering against
        // the kernel matters more than a fast exit
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(target: "supervisor", "handler task failed: {}", e);
            }
        }

        self.teardown().await;
        info!(target: "supervisor", "sandbox torn down");
        Ok(())
    }

    pub async fn teardown(&self) {
        let mut state = self.state.lock().await;
        state.symlinks.teardown();
        state.overlay.teardown();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("init_tid", &self.init_tid)
            .field("notif_fd", &self.notif_fd.get_ref().as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config(name: &str) -> Config {
        Config {
            sandbox_uid: Some("00000000deadbeef".into()),
            overlay_base: std::env::temp_dir().join(format!(".bvisor-sup-{}", name)),
            symlink_root: std::env::temp_dir().join(format!(".bvisor-sup-{}-b", name)),
            max_inflight: 8,
        }
    }

    fn stand_in_fd() -> OwnedFd {
        // any pollable fd works for constructing the supervisor in tests
        let (r, _w) = nix::unistd::pipe().unwrap();
        r
    }

    #[tokio::test]
    async fn construct_and_teardown() {
        let cfg = test_config("basic");
        let base = cfg.overlay_base.clone();
        let sup = Supervisor::new(cfg, 12345, stand_in_fd()).unwrap();
        assert_eq!(sup.init_tid(), 12345);
        {
            let state = sup.state.lock().await;
            assert_eq!(state.threads.len(), 1);
            assert!(state.overlay.root().exists());
        }
        sup.teardown().await;
        let state = sup.state.lock().await;
        assert!(!state.overlay.root().exists());
        drop(state);
        let _ = std::fs::remove_dir_all(base);
    }
}
