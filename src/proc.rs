//! Virtualized /proc.
//!
//! Supported targets: `/proc`, `/proc/self`, `/proc/self/status`,
//! `/proc/<nstgid>` and `/proc/<nstgid>/status`. Everything else is ENOENT.
//! Content is synthesized against the caller's namespace at open time.

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::file::DirEntry;
use crate::task::{Thread, Threads};

pub const GUEST_NAME: &str = "bvisor-guest";

// synthetic inode ranges, one per node class
const INO_PROC_ROOT: u64 = 0x7000_0000;
const INO_SELF: u64 = 0x7000_0001;
const INO_PID_BASE: u64 = 0x7100_0000;
const INO_STATUS_BASE: u64 = 0x7200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcTarget {
    Root,
    SelfDir,
    SelfStatus,
    PidDir(i32),
    Status(i32),
}

fn parse_pid(comp: &str) -> Option<i32> {
    // strict: digits only, no sign, no leading zero, pid > 0
    if comp.is_empty() || comp.starts_with('0') || !comp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    comp.parse::<i32>().ok().filter(|p| *p > 0)
}

/// Parses a normalized absolute path below /proc. Unknown shapes are ENOENT.
pub fn parse(path: &str) -> Result<ProcTarget> {
    let rest = path.strip_prefix("/proc").ok_or(Error::InvalidPath)?;
    let comps: Vec<&str> = rest.split('/').filter(|c| !c.is_empty()).collect();
    match comps.as_slice() {
        [] => Ok(ProcTarget::Root),
        ["self"] => Ok(ProcTarget::SelfDir),
        ["self", "status"] => Ok(ProcTarget::SelfStatus),
        [pid] => parse_pid(pid).map(ProcTarget::PidDir).ok_or(Error::InvalidPath),
        [pid, "status"] => parse_pid(pid).map(ProcTarget::Status).ok_or(Error::InvalidPath),
        _ => Err(Error::InvalidPath),
    }
}

pub fn pid_dir_ino(nstgid: i32) -> u64 {
    INO_PID_BASE + nstgid as u64
}

pub fn status_ino(nstgid: i32) -> u64 {
    INO_STATUS_BASE + nstgid as u64
}

pub fn root_ino() -> u64 {
    INO_PROC_ROOT
}

/// Resolves `/proc/self` and `/proc/<nstgid>` to the target thread group's
/// nstgid in the caller's namespace, checking visibility.
pub fn resolve_nstgid(threads: &Threads, caller: &Thread, target: ProcTarget) -> Result<i32> {
    match target {
        ProcTarget::SelfDir | ProcTarget::SelfStatus => Ok(threads.nstgid(caller)),
        ProcTarget::PidDir(nstgid) | ProcTarget::Status(nstgid) => {
            let abs = caller.ns().abs_of(nstgid).ok_or(Error::InvalidPath)?;
            let target = threads.lookup(abs).map_err(|_| Error::InvalidPath)?;
            // the name must be a process, not a bare thread id
            if caller.ns().nstid_of(target.group().leader()) != Some(nstgid) {
                return Err(Error::InvalidPath);
            }
            Ok(nstgid)
        }
        ProcTarget::Root => Err(Error::Os(Errno::EISDIR)),
    }
}

/// Status file content, snapshot semantics: exactly the Name/Pid/PPid lines
/// in that order.
pub fn status_content(threads: &Threads, caller: &Thread, nstgid: i32) -> Result<Vec<u8>> {
    let abs = caller
        .ns()
        .abs_of(nstgid)
        .ok_or(Error::InvalidPath)?;
    let target = threads.lookup(abs).map_err(|_| Error::InvalidPath)?;
    let nsptgid = threads.nsptgid_in(&target, caller.ns());
    Ok(format!(
        "Name:\t{}\nPid:\t{}\nPPid:\t{}\n",
        GUEST_NAME, nstgid, nsptgid
    )
    .into_bytes())
}

/// Entries for `/proc`: `.`, `..`, `self`, one per NsTid visible in the
/// caller's namespace.
pub fn root_dirents(caller: &Thread) -> Vec<DirEntry> {
    let mut out = vec![
        DirEntry {
            ino: INO_PROC_ROOT,
            name: ".".into(),
            d_type: libc::DT_DIR,
        },
        DirEntry {
            ino: INO_PROC_ROOT,
            name: "..".into(),
            d_type: libc::DT_DIR,
        },
        DirEntry {
            ino: INO_SELF,
            name: "self".into(),
            d_type: libc::DT_LNK,
        },
    ];
    for (nstid, _) in caller.ns().visible() {
        out.push(DirEntry {
            ino: pid_dir_ino(nstid),
            name: nstid.to_string(),
            d_type: libc::DT_DIR,
        });
    }
    out
}

/// Entries for `/proc/<pid>`: `.`, `..`, `status`.
pub fn pid_dirents(nstgid: i32) -> Vec<DirEntry> {
    vec![
        DirEntry {
            ino: pid_dir_ino(nstgid),
            name: ".".into(),
            d_type: libc::DT_DIR,
        },
        DirEntry {
            ino: INO_PROC_ROOT,
            name: "..".into(),
            d_type: libc::DT_DIR,
        },
        DirEntry {
            ino: status_ino(nstgid),
            name: "status".into(),
            d_type: libc::DT_REG,
        },
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::CloneFlags;

    #[test]
    fn strict_parsing() {
        assert_eq!(parse("/proc").unwrap(), ProcTarget::Root);
        assert_eq!(parse("/proc/self").unwrap(), ProcTarget::SelfDir);
        assert_eq!(parse("/proc/self/status").unwrap(), ProcTarget::SelfStatus);
        assert_eq!(parse("/proc/42").unwrap(), ProcTarget::PidDir(42));
        assert_eq!(parse("/proc/42/status").unwrap(), ProcTarget::Status(42));

        for bad in [
            "/proc/0",
            "/proc/-1",
            "/proc/abc",
            "/proc/12a",
            "/proc/012",
            "/proc/42/maps",
            "/proc/self/maps",
            "/proc/42/status/x",
        ] {
            assert!(parse(bad).is_err(), "{} should be ENOENT", bad);
        }
    }

    #[test]
    fn status_for_root_thread() {
        let threads = Threads::new(12345);
        let caller = threads.lookup(12345).unwrap();
        let content = status_content(&threads, &caller, 12345).unwrap();
        let text = String::from_utf8(content).unwrap();
        assert_eq!(text, "Name:\tbvisor-guest\nPid:\t12345\nPPid:\t0\n");
    }

    #[test]
    fn status_in_nested_namespace() {
        let mut threads = Threads::new(100);
        let child = threads.spawn(100, 200, CloneFlags::NEWPID.bits()).unwrap();
        // seen from inside, the child is pid 1 with an invisible parent
        let nstgid = threads.nstgid(&child);
        assert_eq!(nstgid, 1);
        let text =
            String::from_utf8(status_content(&threads, &child, nstgid).unwrap()).unwrap();
        assert!(text.contains("Pid:\t1\n"), "{}", text);
        assert!(text.contains("PPid:\t0\n"), "{}", text);

        // seen from the root namespace the same process has a visible parent
        let outer = threads.lookup(100).unwrap();
        let text =
            String::from_utf8(status_content(&threads, &outer, 200).unwrap()).unwrap();
        assert!(text.contains("Pid:\t200\n"), "{}", text);
        assert!(text.contains("PPid:\t100\n"), "{}", text);
    }

    #[test]
    fn root_listing_tracks_namespace() {
        let mut threads = Threads::new(100);
        threads.spawn(100, 200, 0).unwrap();
        let caller = threads.lookup(100).unwrap();
        let names: Vec<String> = root_dirents(&caller).iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![".", "..", "self", "100", "200"]);
    }

    #[test]
    fn pid_listing_is_fixed() {
        let names: Vec<String> = pid_dirents(7).iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![".", "..", "status"]);
    }

    #[test]
    fn resolve_rejects_invisible_and_nonleader() {
        let mut threads = Threads::new(100);
        let inner = threads.spawn(100, 200, CloneFlags::NEWPID.bits()).unwrap();
        threads.spawn(200, 201, CloneFlags::THREAD.bits()).unwrap();

        // from inside, the root process does not exist
        assert!(resolve_nstgid(&threads, &inner, ProcTarget::PidDir(100)).is_err());

        // a bare thread id is not a /proc entry name
        let outer = threads.lookup(100).unwrap();
        let nstid_201 = outer.ns().nstid_of(201).unwrap();
        assert!(resolve_nstgid(&threads, &outer, ProcTarget::PidDir(nstid_201)).is_err());
        assert!(resolve_nstgid(&threads, &outer, ProcTarget::PidDir(200)).is_ok());
    }
}
