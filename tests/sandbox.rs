//! End-to-end scenarios driven through the dispatcher, with this process
//! standing in for the guest: notifications carry our own tid, so guest
//! memory reads and writes hit real buffers.

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use nix::errno::Errno;

use bvisor::notif::{Notification, Reply};
use bvisor::syscalls;
use bvisor::task::CloneFlags;
use bvisor::{Config, Supervisor};

fn own_tid() -> i32 {
    unsafe { libc::gettid() }
}

fn stand_in_fd() -> OwnedFd {
    let (r, w) = nix::unistd::pipe().unwrap();
    std::mem::forget(w);
    r
}

fn sandbox(name: &str, init_tid: i32) -> Arc<Supervisor> {
    let cfg = Config {
        sandbox_uid: Some("00000000deadbeef".into()),
        overlay_base: std::env::temp_dir().join(format!(".bvisor-e2e-{}", name)),
        symlink_root: std::env::temp_dir().join(format!(".bvisor-e2e-{}-b", name)),
        max_inflight: 8,
    };
    let _ = std::fs::remove_dir_all(&cfg.overlay_base);
    Supervisor::new(cfg, init_tid, stand_in_fd()).unwrap()
}

fn notif(tid: i32, nr: i64, args: [u64; 6]) -> Notification {
    Notification {
        id: 1,
        tid,
        nr: nr as i32,
        args,
    }
}

async fn call(sup: &Supervisor, nr: i64, args: [u64; 6]) -> Reply {
    syscalls::handle(sup, notif(own_tid(), nr, args)).await
}

fn expect_val(reply: Reply) -> i64 {
    match reply {
        Reply::Value(v) => v,
        other => panic!("expected value, got {:?}", other),
    }
}

fn expect_errno(reply: Reply, errno: Errno) {
    assert_eq!(reply, Reply::Failure(errno));
}

async fn open_path(sup: &Supervisor, path: &str, flags: i32, mode: u32) -> Reply {
    let c = CString::new(path).unwrap();
    call(
        sup,
        libc::SYS_openat,
        [
            libc::AT_FDCWD as u64,
            c.as_ptr() as u64,
            flags as u64,
            mode as u64,
            0,
            0,
        ],
    )
    .await
}

// --- process identity ---

#[tokio::test]
async fn getpid_for_root_thread() {
    let sup = sandbox("getpid", 12345);
    let reply = syscalls::handle(&sup, notif(12345, libc::SYS_getpid, [0; 6])).await;
    assert_eq!(reply, Reply::Value(12345));
    let reply = syscalls::handle(&sup, notif(12345, libc::SYS_getppid, [0; 6])).await;
    assert_eq!(reply, Reply::Value(0));
    let reply = syscalls::handle(&sup, notif(12345, libc::SYS_gettid, [0; 6])).await;
    assert_eq!(reply, Reply::Value(12345));
    sup.teardown().await;
}

#[tokio::test]
async fn getpid_in_nested_namespace() {
    let sup = sandbox("getpid-nested", 100);
    {
        let state = &mut *sup.state.lock().await;
        state.threads.spawn(100, 200, CloneFlags::NEWPID.bits()).unwrap();
    }
    let reply = syscalls::handle(&sup, notif(200, libc::SYS_getpid, [0; 6])).await;
    assert_eq!(reply, Reply::Value(1));
    // the parent is invisible from inside
    let reply = syscalls::handle(&sup, notif(200, libc::SYS_getppid, [0; 6])).await;
    assert_eq!(reply, Reply::Value(0));
    sup.teardown().await;
}

// --- routing and the block rules ---

#[tokio::test]
async fn blocked_paths_are_eperm() {
    let tid = own_tid();
    let sup = sandbox("block", tid);
    expect_errno(
        open_path(&sup, "/sys/class/net", libc::O_RDONLY, 0).await,
        Errno::EPERM,
    );
    expect_errno(
        open_path(&sup, "/tmp/.bvisor/anything", libc::O_RDONLY, 0).await,
        Errno::EPERM,
    );
    // normalization happens before routing
    expect_errno(
        open_path(&sup, "/proc/../sys/class/net", libc::O_RDONLY, 0).await,
        Errno::EPERM,
    );
    sup.teardown().await;
}

#[tokio::test]
async fn dev_null_passes_through() {
    let tid = own_tid();
    let sup = sandbox("devnull", tid);
    let vfd = expect_val(open_path(&sup, "/dev/null", libc::O_RDWR, 0).await);
    assert!(vfd >= 3);

    let data = b"discarded";
    let n = expect_val(
        call(
            &sup,
            libc::SYS_write,
            [vfd as u64, data.as_ptr() as u64, data.len() as u64, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 9);

    let r = expect_val(call(&sup, libc::SYS_close, [vfd as u64, 0, 0, 0, 0, 0]).await);
    assert_eq!(r, 0);
    sup.teardown().await;
}

// --- COW overlay ---

#[tokio::test]
async fn cow_create_write_read_back() {
    let tid = own_tid();
    let sup = sandbox("cow", tid);
    let path = "/etc/bvisor-e2e-cow.txt";

    let v1 = expect_val(
        open_path(&sup, path, libc::O_WRONLY | libc::O_CREAT, 0o644).await,
    );
    let data = b"hello bvisor";
    let n = expect_val(
        call(
            &sup,
            libc::SYS_write,
            [v1 as u64, data.as_ptr() as u64, data.len() as u64, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 12);
    expect_val(call(&sup, libc::SYS_close, [v1 as u64, 0, 0, 0, 0, 0]).await);

    // nothing appeared on the host /etc
    assert!(!std::path::Path::new(path).exists());

    let v2 = expect_val(open_path(&sup, path, libc::O_RDONLY, 0).await);
    let mut buf = [0u8; 64];
    let n = expect_val(
        call(
            &sup,
            libc::SYS_read,
            [v2 as u64, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 12);
    assert_eq!(&buf[..12], b"hello bvisor");
    sup.teardown().await;
}

#[tokio::test]
async fn private_tmp_and_cwd() {
    let tid = own_tid();
    let sup = sandbox("tmpcwd", tid);

    let c = CString::new("/tmp").unwrap();
    expect_val(call(&sup, libc::SYS_chdir, [c.as_ptr() as u64, 0, 0, 0, 0, 0]).await);

    let mut cwd = [0u8; 64];
    let n = expect_val(
        call(
            &sup,
            libc::SYS_getcwd,
            [cwd.as_mut_ptr() as u64, cwd.len() as u64, 0, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(&cwd[..n as usize], b"/tmp\0");

    // a relative openat resolves against the virtual cwd into private /tmp
    let vfd = expect_val(
        open_path(&sup, "note.txt", libc::O_WRONLY | libc::O_CREAT, 0o600).await,
    );
    expect_val(call(&sup, libc::SYS_close, [vfd as u64, 0, 0, 0, 0, 0]).await);
    assert!(!std::path::Path::new("/tmp/note.txt").exists());
    {
        let state = sup.state.lock().await;
        assert!(state.overlay.tmp_exists("/tmp/note.txt"));
    }
    sup.teardown().await;
}

// --- tombstones ---

#[tokio::test]
async fn unlink_tombstones_and_creat_resurrects() {
    let tid = own_tid();
    let sup = sandbox("tombstone", tid);
    let path = "/etc/bvisor-e2e-tomb.txt";

    let vfd = expect_val(
        open_path(&sup, path, libc::O_WRONLY | libc::O_CREAT, 0o644).await,
    );
    expect_val(call(&sup, libc::SYS_close, [vfd as u64, 0, 0, 0, 0, 0]).await);

    let c = CString::new(path).unwrap();
    expect_val(
        call(
            &sup,
            libc::SYS_unlinkat,
            [libc::AT_FDCWD as u64, c.as_ptr() as u64, 0, 0, 0, 0],
        )
        .await,
    );

    expect_errno(open_path(&sup, path, libc::O_RDONLY, 0).await, Errno::ENOENT);

    // O_CREAT clears the tombstone
    let vfd = expect_val(
        open_path(&sup, path, libc::O_WRONLY | libc::O_CREAT, 0o644).await,
    );
    expect_val(call(&sup, libc::SYS_close, [vfd as u64, 0, 0, 0, 0, 0]).await);
    let r = expect_val(open_path(&sup, path, libc::O_RDONLY, 0).await);
    assert!(r >= 3);
    sup.teardown().await;
}

// --- fd table behavior through the handlers ---

#[tokio::test]
async fn dup_then_close_original() {
    let tid = own_tid();
    let sup = sandbox("dup", tid);
    let vfd = expect_val(open_path(&sup, "/dev/null", libc::O_RDWR, 0).await);
    let dup = expect_val(call(&sup, libc::SYS_dup, [vfd as u64, 0, 0, 0, 0, 0]).await);
    assert_ne!(vfd, dup);

    expect_val(call(&sup, libc::SYS_close, [vfd as u64, 0, 0, 0, 0, 0]).await);

    let data = b"x";
    let n = expect_val(
        call(
            &sup,
            libc::SYS_write,
            [dup as u64, data.as_ptr() as u64, 1, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 1);

    // double close of the original is EBADF
    expect_errno(
        call(&sup, libc::SYS_close, [vfd as u64, 0, 0, 0, 0, 0]).await,
        Errno::EBADF,
    );
    sup.teardown().await;
}

#[tokio::test]
async fn fcntl_cloexec_bit() {
    let tid = own_tid();
    let sup = sandbox("fcntl", tid);
    let vfd = expect_val(open_path(&sup, "/dev/null", libc::O_RDWR, 0).await);

    let flags = expect_val(
        call(&sup, libc::SYS_fcntl, [vfd as u64, libc::F_GETFD as u64, 0, 0, 0, 0]).await,
    );
    assert_eq!(flags, 0);
    expect_val(
        call(
            &sup,
            libc::SYS_fcntl,
            [vfd as u64, libc::F_SETFD as u64, libc::FD_CLOEXEC as u64, 0, 0, 0],
        )
        .await,
    );
    let flags = expect_val(
        call(&sup, libc::SYS_fcntl, [vfd as u64, libc::F_GETFD as u64, 0, 0, 0, 0]).await,
    );
    assert_eq!(flags, libc::FD_CLOEXEC as i64);

    // unsupported commands are EINVAL
    expect_errno(
        call(&sup, libc::SYS_fcntl, [vfd as u64, libc::F_GETLK as u64, 0, 0, 0, 0]).await,
        Errno::EINVAL,
    );
    sup.teardown().await;
}

// --- staging-buffer boundaries ---

#[tokio::test]
async fn oversized_write_completes_short() {
    let tid = own_tid();
    let sup = sandbox("shortwrite", tid);
    let vfd = expect_val(
        open_path(&sup, "/tmp/big.bin", libc::O_WRONLY | libc::O_CREAT, 0o600).await,
    );
    let data = vec![0xabu8; 8192];
    let n = expect_val(
        call(
            &sup,
            libc::SYS_write,
            [vfd as u64, data.as_ptr() as u64, data.len() as u64, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 4096);
    sup.teardown().await;
}

#[tokio::test]
async fn writev_truncates_to_sixteen_iovecs() {
    let tid = own_tid();
    let sup = sandbox("writev", tid);
    let vfd = expect_val(
        open_path(&sup, "/tmp/iov.bin", libc::O_WRONLY | libc::O_CREAT, 0o600).await,
    );

    let chunk = [0x5au8; 1];
    let iovs: Vec<[u64; 2]> = (0..20)
        .map(|_| [chunk.as_ptr() as u64, 1u64])
        .collect();
    let n = expect_val(
        call(
            &sup,
            libc::SYS_writev,
            [vfd as u64, iovs.as_ptr() as u64, 20, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 16);
    sup.teardown().await;
}

#[tokio::test]
async fn eventfd_roundtrip() {
    let tid = own_tid();
    let sup = sandbox("eventfd", tid);
    let vfd = expect_val(call(&sup, libc::SYS_eventfd2, [0, 0, 0, 0, 0, 0]).await);

    let val = 7u64.to_ne_bytes();
    let n = expect_val(
        call(
            &sup,
            libc::SYS_write,
            [vfd as u64, val.as_ptr() as u64, 8, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 8);

    let mut out = [0u8; 8];
    let n = expect_val(
        call(
            &sup,
            libc::SYS_read,
            [vfd as u64, out.as_mut_ptr() as u64, 8, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n, 8);
    assert_eq!(u64::from_ne_bytes(out), 7);

    // an eventfd is not seekable
    let reply = call(&sup, libc::SYS_lseek, [vfd as u64, 0, 0, 0, 0, 0]).await;
    assert_eq!(reply, Reply::Failure(Errno::ESPIPE));
    sup.teardown().await;
}

// --- /proc ---

#[tokio::test]
async fn proc_self_status_snapshot() {
    let tid = own_tid();
    let sup = sandbox("procstatus", tid);
    let vfd = expect_val(open_path(&sup, "/proc/self/status", libc::O_RDONLY, 0).await);

    let mut buf = [0u8; 256];
    let n = expect_val(
        call(
            &sup,
            libc::SYS_read,
            [vfd as u64, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0],
        )
        .await,
    );
    let text = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
    assert_eq!(
        text,
        format!("Name:\tbvisor-guest\nPid:\t{}\nPPid:\t0\n", tid)
    );

    // snapshot: size via fstat matches content length
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    expect_val(
        call(
            &sup,
            libc::SYS_fstat,
            [vfd as u64, &mut st as *mut _ as u64, 0, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(st.st_size as usize, n as usize);
    assert_eq!(st.st_mode as u32, libc::S_IFREG | 0o444);
    sup.teardown().await;
}

#[tokio::test]
async fn proc_listing_has_self_and_pids() {
    let tid = own_tid();
    let sup = sandbox("proclist", tid);
    let vfd = expect_val(
        open_path(&sup, "/proc", libc::O_RDONLY | libc::O_DIRECTORY, 0).await,
    );

    let mut buf = [0u8; 4096];
    let n = expect_val(
        call(
            &sup,
            libc::SYS_getdents64,
            [vfd as u64, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0],
        )
        .await,
    ) as usize;
    assert!(n > 0);

    let mut names = Vec::new();
    let mut at = 0;
    while at < n {
        let reclen = u16::from_le_bytes(buf[at + 16..at + 18].try_into().unwrap()) as usize;
        let name_end = buf[at + 19..at + reclen].iter().position(|&b| b == 0).unwrap();
        names.push(String::from_utf8_lossy(&buf[at + 19..at + 19 + name_end]).into_owned());
        at += reclen;
    }
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"self".to_string()));
    assert!(names.contains(&tid.to_string()));

    // a second call continues from the cursor and eventually drains
    let n2 = expect_val(
        call(
            &sup,
            libc::SYS_getdents64,
            [vfd as u64, buf.as_mut_ptr() as u64, buf.len() as u64, 0, 0, 0],
        )
        .await,
    );
    assert_eq!(n2, 0);
    sup.teardown().await;
}

#[tokio::test]
async fn proc_unknown_pids_are_enoent() {
    let tid = own_tid();
    let sup = sandbox("procbad", tid);
    expect_errno(
        open_path(&sup, "/proc/999999999", libc::O_RDONLY, 0).await,
        Errno::ENOENT,
    );
    expect_errno(
        open_path(&sup, "/proc/0", libc::O_RDONLY, 0).await,
        Errno::ENOENT,
    );
    expect_errno(
        open_path(&sup, "/proc/self/maps", libc::O_RDONLY, 0).await,
        Errno::ENOENT,
    );
    sup.teardown().await;
}

// --- kill visibility ---

#[tokio::test]
async fn kill_visibility_and_validation() {
    let sup = sandbox("kill", 100);
    {
        let state = &mut *sup.state.lock().await;
        state.threads.spawn(100, 200, CloneFlags::NEWPID.bits()).unwrap();
    }
    // kill(-1) is EINVAL
    let reply = syscalls::handle(
        &sup,
        notif(100, libc::SYS_kill, [-1i64 as u64, libc::SIGTERM as u64, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(reply, Reply::Failure(Errno::EINVAL));

    // the inner thread cannot address anything in the outer namespace
    let reply = syscalls::handle(
        &sup,
        notif(200, libc::SYS_kill, [100, libc::SIGTERM as u64, 0, 0, 0, 0]),
    )
    .await;
    assert_eq!(reply, Reply::Failure(Errno::ESRCH));
    sup.teardown().await;
}

// --- synthesized system info ---

#[tokio::test]
async fn uname_leaks_nothing() {
    let tid = own_tid();
    let sup = sandbox("uname", tid);
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    expect_val(
        call(
            &sup,
            libc::SYS_uname,
            [&mut uts as *mut _ as u64, 0, 0, 0, 0, 0],
        )
        .await,
    );
    let nodename = unsafe { std::ffi::CStr::from_ptr(uts.nodename.as_ptr()) };
    assert_eq!(nodename.to_str().unwrap(), "bvisor-guest");
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    assert!(release.to_str().unwrap().contains("bvisor"));
    sup.teardown().await;
}

// --- dispatch table edges ---

#[tokio::test]
async fn blocked_and_unknown_syscalls() {
    let tid = own_tid();
    let sup = sandbox("table", tid);
    let reply = call(&sup, libc::SYS_ptrace, [0; 6]).await;
    assert_eq!(reply, Reply::Failure(Errno::EPERM));

    let reply = call(&sup, 0x7fff_0001, [0; 6]).await;
    assert_eq!(reply, Reply::Failure(Errno::ENOSYS));

    let reply = call(&sup, libc::SYS_brk, [0; 6]).await;
    assert_eq!(reply, Reply::Continue);
    sup.teardown().await;
}

// --- exit bookkeeping ---

#[tokio::test]
async fn exit_group_cleans_the_registry() {
    let sup = sandbox("exit", 100);
    {
        let state = &mut *sup.state.lock().await;
        state.threads.spawn(100, 200, 0).unwrap();
        state
            .threads
            .spawn(200, 201, CloneFlags::THREAD.bits())
            .unwrap();
    }
    let reply = syscalls::handle(&sup, notif(201, libc::SYS_exit_group, [0; 6])).await;
    assert_eq!(reply, Reply::Continue);
    {
        let state = sup.state.lock().await;
        assert!(state.threads.get(200).is_none());
        assert!(state.threads.get(201).is_none());
        assert!(state.threads.get(100).is_some());
    }
    sup.teardown().await;
}
