//! Signals and liveness checks for the emulator process.

use std::io;

/// `kill(pid, sig)`.
pub(crate) fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let ret = unsafe { libc::kill(pid, sig) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// True when `pid` exists and has not already exited. Zombies count as
/// exited: a process we did not spawn cannot be reaped by us.
pub(crate) fn is_alive(pid: u32) -> bool {
    let exists = match signal(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    };
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| proc_state(&stat))
        .is_some_and(|state| state == 'Z' || state == 'X')
}

/// State letter from a `/proc/<pid>/stat` line. The command name is
/// parenthesised and may itself contain spaces or parentheses.
pub(crate) fn proc_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Whether `/proc/<pid>/cmdline` mentions `needle`. Hosts without `/proc`
/// cannot be checked and report `true`.
pub(crate) fn cmdline_mentions(pid: u32, needle: &str) -> bool {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
            cmdline.contains(needle)
        }
        Err(_) => !std::path::Path::new("/proc/self").exists(),
    }
}
