//! System information handlers. Everything is synthesized constants so no
//! host identity leaks into the sandbox.

use crate::error::Result;
use crate::notif::{Notification, Reply};
use crate::supervisor::Supervisor;

use super::write_struct;

pub const KERNEL_RELEASE: &str = "6.1.0-bvisor";

fn put(field: &mut [libc::c_char; 65], value: &str) {
    for (dst, src) in field.iter_mut().zip(value.as_bytes()) {
        *dst = *src as libc::c_char;
    }
}

pub async fn uname(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    {
        let state = &mut *sup.state.lock().await;
        state.threads.lookup_or_register(n.tid)?;
    }
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    put(&mut uts.sysname, "Linux");
    put(&mut uts.nodename, crate::proc::GUEST_NAME);
    put(&mut uts.release, KERNEL_RELEASE);
    put(&mut uts.version, "#1 SMP bvisor");
    #[cfg(target_arch = "x86_64")]
    put(&mut uts.machine, "x86_64");
    #[cfg(target_arch = "aarch64")]
    put(&mut uts.machine, "aarch64");
    write_struct(n.tid, n.args[0], &uts)?;
    Ok(Reply::Value(0))
}

/// Zeroed resource counters: the guest learns nothing about host load or
/// memory.
pub async fn sysinfo(sup: &Supervisor, n: &Notification) -> Result<Reply> {
    {
        let state = &mut *sup.state.lock().await;
        state.threads.lookup_or_register(n.tid)?;
    }
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    info.uptime = 0;
    info.procs = 1;
    info.mem_unit = 1;
    write_struct(n.tid, n.args[0], &info)?;
    Ok(Reply::Value(0))
}
