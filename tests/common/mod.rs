//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use netlab::topology::Topology;

/// Check integration test dependencies (root + iproute2 family). Returns
/// `true` if tests should be skipped, printing the reason to stderr.
/// Use at the top of every test.
pub fn skip_without_deps() -> bool {
    match netkit::verify_host() {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

/// Like `skip_without_deps` but also requires netem for shaping tests.
pub fn skip_without_netem() -> bool {
    match netkit::verify_netem() {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

/// Like `skip_without_deps` but also requires tcpdump for observer tests.
pub fn skip_without_tcpdump() -> bool {
    if skip_without_deps() {
        return true;
    }
    if netkit::probe::check_binary("tcpdump").is_none() {
        eprintln!("Skipping: tcpdump not found in PATH");
        return true;
    }
    false
}

/// A topology wired to a drained event channel, with a short terminal
/// grace period so tests don't wait on detached sessions.
pub fn test_topology() -> Arc<Topology> {
    let (events_tx, events_rx) = netlab::events::channel();
    tokio::spawn(netlab::events::run_listener(events_rx));
    Topology::new(events_tx, Duration::from_secs(2))
}

/// Unique device name safe for parallel tests (also a valid netns name).
pub fn unique_device(prefix: &str) -> String {
    netkit::unique_name(prefix)
}

/// Ping once from inside a device's namespace; true on success.
pub async fn ping(topology: &Arc<Topology>, from: &str, target: &str) -> bool {
    let argv = vec![
        "ping".to_string(),
        "-c".to_string(),
        "1".to_string(),
        "-W".to_string(),
        "1".to_string(),
        target.to_string(),
    ];
    match topology
        .exec(from, &argv, Duration::from_secs(5))
        .await
    {
        Ok(outcome) => outcome.exit_code == Some(0),
        Err(e) => {
            eprintln!("ping exec failed: {e}");
            false
        }
    }
}

/// Namespaces currently present on the host.
pub async fn host_namespaces() -> Vec<String> {
    netkit::Netns::list().await.unwrap_or_default()
}
