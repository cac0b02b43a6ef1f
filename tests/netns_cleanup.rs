//! Cleanup-totality integration tests.
//!
//! Tearing down the topology must leave no namespaces and no stray veth
//! interfaces, matching what a server shutdown guarantees.

mod common;

use netlab::topology::{DeviceKind, DeviceSpec, LinkSpec};

#[tokio::test(flavor = "multi_thread")]
async fn teardown_leaves_no_kernel_state() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();

    // A small mesh: three hosts and a router, links between all of them
    // and the router.
    let router = common::unique_device("nlc_r");
    topology
        .add_device(DeviceSpec {
            name: router.clone(),
            kind: DeviceKind::Router,
            x: None,
            y: None,
            addr: None,
        })
        .await
        .expect("router");

    let mut hosts = Vec::new();
    for i in 0..3 {
        let name = common::unique_device(&format!("nlc_h{i}"));
        topology
            .add_device(DeviceSpec {
                name: name.clone(),
                kind: DeviceKind::Host,
                x: None,
                y: None,
                addr: None,
            })
            .await
            .expect("host");
        topology
            .add_link(LinkSpec {
                device_a: name.clone(),
                device_b: router.clone(),
                ..Default::default()
            })
            .await
            .expect("link");
        hosts.push(name);
    }

    let created: Vec<String> = hosts.iter().cloned().chain([router.clone()]).collect();
    let live = common::host_namespaces().await;
    for name in &created {
        assert!(live.contains(name), "{name} should exist before teardown");
    }

    topology.cleanup().await;

    let live = common::host_namespaces().await;
    for name in &created {
        assert!(!live.contains(name), "{name} leaked after teardown");
    }

    // No scratch veth ends left behind in the root namespace either.
    let out = tokio::process::Command::new("ip")
        .args(["-o", "link", "show"])
        .output()
        .await
        .expect("ip link");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        !stdout.contains("veth-"),
        "stray veth interfaces in root namespace:\n{stdout}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn device_removal_tears_down_dependent_links_first() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlc_a");
    let h2 = common::unique_device("nlc_b");

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
            .expect("add");
    }
    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("link");

    topology.remove_device(&h1).await.expect("remove");

    // Link is gone from the record and the peer interface is gone from
    // the surviving namespace.
    assert!(topology.list_links().is_empty());
    let view = topology.inspect(&h2).await.expect("inspect survivor");
    assert!(
        !view.live_interfaces.iter().any(|i| i.name == "eth0"),
        "peer veth end must be deleted with the pair"
    );

    // Removal is idempotent.
    topology.remove_device(&h1).await.expect("second remove ok");

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn add_then_remove_returns_to_prior_state() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let before = common::host_namespaces().await;

    let name = common::unique_device("nlc_rt");
    topology
        .add_device(DeviceSpec {
            name: name.clone(),
            kind: DeviceKind::Host,
            x: None,
            y: None,
            addr: None,
        })
        .await
        .expect("add");
    topology.remove_device(&name).await.expect("remove");

    let after = common::host_namespaces().await;
    assert_eq!(before, after, "namespace set must be unchanged");

    let status = topology.status();
    assert_eq!(status.devices, 0);
    assert_eq!(status.sessions, 0);
    assert_eq!(status.observers, 0);
}
