use std::fs;

use serde::Serialize;
use tracing::debug;

const MIB: f64 = 1024.0 * 1024.0;

/// Resource consumption of the running emulator process, averaged over its
/// lifetime. All zeros while the VM is stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_io_mbps: f64,
    pub network_mbps: f64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct StatTimes {
    pub utime: u64,
    pub stime: u64,
    pub starttime: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct IoCounters {
    pub rchar: u64,
    pub wchar: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Sample `/proc/<pid>`. Without `/proc` only the configured memory is known.
pub(crate) fn sample(pid: u32, configured_memory_mb: u64) -> ResourceUsage {
    let fallback = ResourceUsage {
        memory_mb: configured_memory_mb as f64,
        ..ResourceUsage::default()
    };

    let Some(times) = read(pid, "stat").and_then(|s| parse_stat(&s)) else {
        debug!(pid, "no /proc stat for VM process, reporting configured memory");
        return fallback;
    };
    let Some(uptime) = read_uptime() else {
        return fallback;
    };

    let ticks = clock_ticks();
    let elapsed = (uptime - times.starttime as f64 / ticks).max(1.0 / ticks);
    let cpu_seconds = (times.utime + times.stime) as f64 / ticks;

    let memory_mb = read(pid, "status")
        .and_then(|s| parse_vm_rss_kb(&s))
        .map(|kb| kb as f64 / 1024.0)
        .unwrap_or(configured_memory_mb as f64);

    let io = read(pid, "io").map(|s| parse_io(&s)).unwrap_or_default();
    let disk_bytes = io.read_bytes + io.write_bytes;
    let char_bytes = io.rchar + io.wchar;

    ResourceUsage {
        cpu_percent: cpu_seconds / elapsed * 100.0,
        memory_mb,
        disk_io_mbps: disk_bytes as f64 / MIB / elapsed,
        network_mbps: char_bytes.saturating_sub(disk_bytes) as f64 / MIB / elapsed,
    }
}

fn read(pid: u32, file: &str) -> Option<String> {
    fs::read_to_string(format!("/proc/{pid}/{file}")).ok()
}

fn read_uptime() -> Option<f64> {
    fs::read_to_string("/proc/uptime")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn clock_ticks() -> f64 {
    // SAFETY: sysconf only reads a configuration value.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// utime, stime and starttime (fields 14, 15 and 22) of a stat line.
pub(crate) fn parse_stat(stat: &str) -> Option<StatTimes> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state)
    let field = |n: usize| fields.get(n - 3)?.parse::<u64>().ok();
    Some(StatTimes {
        utime: field(14)?,
        stime: field(15)?,
        starttime: field(22)?,
    })
}

pub(crate) fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

pub(crate) fn parse_io(io: &str) -> IoCounters {
    let mut counters = IoCounters::default();
    for line in io.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key.trim() {
            "rchar" => counters.rchar = value,
            "wchar" => counters.wchar = value,
            "read_bytes" => counters.read_bytes = value,
            "write_bytes" => counters.write_bytes = value,
            _ => {}
        }
    }
    counters
}
