//! Host environment probing.
//!
//! The emulator needs root (or CAP_NET_ADMIN + CAP_SYS_ADMIN) and the
//! iproute2/netfilter/capture tool family. Startup verifies all of it once
//! and aborts with a diagnostic rather than failing per-operation later;
//! tests use the same checks to skip gracefully on unprivileged hosts.

use std::path::PathBuf;
use std::process::Command;

/// Tools every deployment needs. `tcpdump` is listed separately because
/// only packet observation depends on it.
pub const REQUIRED_TOOLS: &[&str] = &["ip", "tc", "iptables", "sysctl", "ss"];

/// Reason the host cannot run the emulator (or a test must be skipped).
#[derive(Debug)]
pub enum HostDefect {
    NotPrivileged,
    MissingTool(String),
    NoNetem,
}

impl std::fmt::Display for HostDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostDefect::NotPrivileged => {
                write!(f, "requires root (namespace admin capability)")
            }
            HostDefect::MissingTool(t) => write!(f, "system tool '{t}' not found in PATH"),
            HostDefect::NoNetem => write!(
                f,
                "sch_netem kernel module not available (try: modprobe sch_netem)"
            ),
        }
    }
}

/// Check if a binary exists in PATH.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    Command::new("sh")
        .args(["-c", &format!("command -v {name}")])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}

/// True when namespace administration works from this process.
pub fn check_privileges() -> bool {
    Command::new("ip")
        .args(["netns", "list"])
        .output()
        .is_ok_and(|o| o.status.success())
        && Command::new("ip")
            .args(["link", "show"])
            .output()
            .is_ok_and(|o| o.status.success())
        && euid_is_root()
}

fn euid_is_root() -> bool {
    // `id -u` instead of a libc binding keeps this crate free of unsafe.
    Command::new("id")
        .arg("-u")
        .output()
        .is_ok_and(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
}

/// Verify the host can run the emulator: privileges plus required tools.
pub fn verify_host() -> Result<(), HostDefect> {
    if !check_privileges() {
        return Err(HostDefect::NotPrivileged);
    }
    for tool in REQUIRED_TOOLS {
        if check_binary(tool).is_none() {
            return Err(HostDefect::MissingTool(tool.to_string()));
        }
    }
    Ok(())
}

/// Like [`verify_host`] but also requires netem (tests that shape traffic).
pub fn verify_netem() -> Result<(), HostDefect> {
    verify_host()?;
    let ok = Command::new("modprobe")
        .arg("sch_netem")
        .output()
        .is_ok_and(|o| o.status.success());
    if !ok {
        return Err(HostDefect::NoNetem);
    }
    Ok(())
}

/// Generate a unique namespace/interface name safe for parallel tests.
///
/// Combines prefix + PID + atomic counter; the prefix is truncated if the
/// whole name would exceed the 15-char netdev limit.
pub fn unique_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let suffix = format!("_{pid:x}_{seq}");
    let max_prefix = 15_usize.saturating_sub(suffix.len());
    let truncated = &prefix[..prefix.len().min(max_prefix)];
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_fit_and_differ() {
        let a = unique_name("nst_a");
        let b = unique_name("nst_a");
        assert_ne!(a, b);
        assert!(a.len() <= 15);
        assert!(b.len() <= 15);
    }

    #[test]
    fn long_prefix_is_truncated() {
        let name = unique_name("averyveryverylongprefix");
        assert!(name.len() <= 15, "{name}");
    }

    #[test]
    fn sh_is_always_present() {
        assert!(check_binary("sh").is_some());
        assert!(check_binary("definitely-not-a-real-tool-xyz").is_none());
    }
}
