//! Resident-set-size sampling for worker processes.
//!
//! Linux reads `VmRSS` from `/proc/<pid>/status`. Other platforms report no
//! sample, which disables memory-based recycling rather than guessing.

/// Extract `VmRSS` (KiB) from the contents of a `/proc/<pid>/status` file.
#[must_use]
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// Resident memory of `pid` in MiB.
#[cfg(target_os = "linux")]
pub async fn rss_mb(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb / 1024)
}

/// Resident memory of `pid` in MiB.
#[cfg(not(target_os = "linux"))]
pub async fn rss_mb(_pid: u32) -> Option<u64> {
    None
}

/// Resident memory of the calling process in MiB. Used by workers to
/// self-report in heartbeats.
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb / 1024)
}

/// Resident memory of the calling process in MiB. Used by workers to
/// self-report in heartbeats.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_rss_mb() -> Option<u64> {
    None
}
