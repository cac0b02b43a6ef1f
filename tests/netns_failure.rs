//! Failure-injection integration tests.
//!
//! Every verb goes through the kernel (qdiscs, filter rules, admin state);
//! these tests assert the observable effect and that clearing restores the
//! pre-injection behavior.

mod common;

use std::sync::Arc;

use netlab::Failure;
use netlab::topology::{DeviceKind, DeviceSpec, LinkSpec, Topology};

async fn two_host_lab(prefix: &str) -> (Arc<Topology>, String, String) {
    let topology = common::test_topology();
    let h1 = common::unique_device(&format!("{prefix}a"));
    let h2 = common::unique_device(&format!("{prefix}b"));
    for name in [&h1, &h2] {
        topology
            .add_device(DeviceSpec {
                name: name.clone(),
                kind: DeviceKind::Host,
                x: None,
                y: None,
                addr: None,
            })
            .await
            .expect("add device");
    }
    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("link");
    (topology, h1, h2)
}

#[tokio::test(flavor = "multi_thread")]
async fn total_packet_loss_blocks_ping_and_clear_restores() {
    if common::skip_without_netem() {
        return;
    }
    let (topology, h1, _h2) = two_host_lab("nlf_l").await;

    assert!(common::ping(&topology, &h1, "10.0.1.2").await, "baseline");

    topology
        .inject_failure(
            &h1,
            Failure::PacketLoss {
                iface: "eth0".into(),
                pct: 100.0,
            },
        )
        .await
        .expect("inject");
    assert!(
        !common::ping(&topology, &h1, "10.0.1.2").await,
        "100% loss must drop everything"
    );

    topology
        .clear_failure(&h1, "packet_loss", Some("eth0"))
        .await
        .expect("clear");
    assert!(
        common::ping(&topology, &h1, "10.0.1.2").await,
        "clearing restores connectivity"
    );

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn interface_down_blocks_and_up_restores() {
    if common::skip_without_deps() {
        return;
    }
    let (topology, h1, _h2) = two_host_lab("nlf_d").await;

    topology
        .inject_failure(&h1, Failure::InterfaceDown { iface: "eth0".into() })
        .await
        .expect("inject");
    assert!(!common::ping(&topology, &h1, "10.0.1.2").await);

    topology
        .clear_failure(&h1, "interface_down", Some("eth0"))
        .await
        .expect("clear");
    assert!(common::ping(&topology, &h1, "10.0.1.2").await);

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn block_icmp_drops_egress_pings() {
    if common::skip_without_deps() {
        return;
    }
    let (topology, h1, _h2) = two_host_lab("nlf_i").await;

    topology
        .inject_failure(&h1, Failure::BlockIcmp)
        .await
        .expect("inject");
    assert!(!common::ping(&topology, &h1, "10.0.1.2").await);

    // Idempotent reinjection, then clear.
    topology
        .inject_failure(&h1, Failure::BlockIcmp)
        .await
        .expect("reinject is idempotent");
    topology
        .clear_failure(&h1, "block_icmp", None)
        .await
        .expect("clear");
    assert!(common::ping(&topology, &h1, "10.0.1.2").await);

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reinjection_replaces_parameters_instead_of_stacking() {
    if common::skip_without_netem() {
        return;
    }
    let (topology, h1, _h2) = two_host_lab("nlf_r").await;

    topology
        .inject_failure(
            &h1,
            Failure::PacketLoss {
                iface: "eth0".into(),
                pct: 100.0,
            },
        )
        .await
        .expect("first");
    topology
        .inject_failure(
            &h1,
            Failure::PacketLoss {
                iface: "eth0".into(),
                pct: 0.0,
            },
        )
        .await
        .expect("replace with 0%");

    // pct=0 is equivalent to no loss at all.
    assert!(common::ping(&topology, &h1, "10.0.1.2").await);

    let failures = topology.list_failures();
    assert_eq!(
        failures
            .iter()
            .filter(|f| f.device == h1)
            .count(),
        1,
        "replacement, not stacking"
    );

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_router_requires_a_router() {
    if common::skip_without_deps() {
        return;
    }
    let (topology, h1, _h2) = two_host_lab("nlf_s").await;

    let err = topology
        .inject_failure(&h1, Failure::SilentRouter)
        .await
        .unwrap_err();
    assert_eq!(err.kind, netlab::ErrorKind::InvalidArgument);

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn clearing_an_absent_failure_is_idempotent() {
    if common::skip_without_deps() {
        return;
    }
    let (topology, h1, _h2) = two_host_lab("nlf_c").await;

    topology
        .clear_failure(&h1, "block_icmp", None)
        .await
        .expect("clearing nothing succeeds");
    topology
        .clear_failure(&h1, "packet_loss", Some("eth0"))
        .await
        .expect("clearing nothing succeeds");

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn latency_shaping_raises_rtt() {
    if common::skip_without_netem() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlf_ta");
    let h2 = common::unique_device("nlf_tb");
    for name in [&h1, &h2] {
        topology
            .add_device(DeviceSpec {
                name: name.clone(),
                kind: DeviceKind::Host,
                x: None,
                y: None,
                addr: None,
            })
            .await
            .expect("add device");
    }
    // 50ms on each end => RTT >= 100ms.
    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            latency_ms: Some(50),
            ..Default::default()
        })
        .await
        .expect("shaped link");

    let argv: Vec<String> = ["ping", "-c", "3", "-i", "0.2", "10.0.1.2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let outcome = topology
        .exec(&h1, &argv, std::time::Duration::from_secs(10))
        .await
        .expect("ping");
    assert_eq!(outcome.exit_code, Some(0), "stderr: {}", outcome.stderr);

    let rtt = parse_min_rtt(&outcome.stdout).expect("rtt line");
    assert!(rtt >= 95.0, "RTT {rtt}ms < expected 100ms round trip");

    topology.cleanup().await;
}

/// Pull min RTT out of ping's `rtt min/avg/max/mdev = a/b/c/d ms` line.
fn parse_min_rtt(stdout: &str) -> Option<f64> {
    let line = stdout.lines().find(|l| l.contains("min/avg/max"))?;
    let values = line.split('=').nth(1)?.trim();
    values.split('/').next()?.parse().ok()
}
