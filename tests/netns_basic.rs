//! Basic topology integration tests.
//!
//! Validates device and link lifecycle against the real kernel: namespace
//! creation, automatic addressing, L3 reachability, and pool rewind.

mod common;

use netlab::topology::{DeviceKind, DeviceSpec, LinkSpec};

fn host_spec(name: &str) -> DeviceSpec {
    DeviceSpec {
        name: name.to_string(),
        kind: DeviceKind::Host,
        x: None,
        y: None,
        addr: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn device_creates_namespace_with_loopback() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let name = common::unique_device("nlb_lo");

    topology.add_device(host_spec(&name)).await.expect("add device");
    assert!(common::host_namespaces().await.contains(&name));

    let view = topology.inspect(&name).await.expect("inspect");
    let lo = view
        .live_interfaces
        .iter()
        .find(|i| i.name == "lo")
        .expect("loopback present");
    assert!(lo.up, "loopback must be up");

    topology.cleanup().await;
    assert!(!common::host_namespaces().await.contains(&name));
}

#[tokio::test(flavor = "multi_thread")]
async fn router_gets_forwarding_hosts_do_not() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let host = common::unique_device("nlb_h");
    let router = common::unique_device("nlb_r");

    topology.add_device(host_spec(&host)).await.expect("host");
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

    assert!(!topology.inspect(&host).await.unwrap().forwarding);
    assert!(topology.inspect(&router).await.unwrap().forwarding);

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_host_link_assigns_first_subnet_and_pings() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlb_a");
    let h2 = common::unique_device("nlb_b");

    topology.add_device(host_spec(&h1)).await.expect("h1");
    topology.add_device(host_spec(&h2)).await.expect("h2");

    let link = topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("link");

    // First p2p link draws 10.0.1.0/24; .1 to the first device, .2 to
    // the second.
    let snap = topology.snapshot();
    let d1 = snap.devices.iter().find(|d| d.name == h1).unwrap();
    let d2 = snap.devices.iter().find(|d| d.name == h2).unwrap();
    assert_eq!(d1.interfaces[0].address.as_deref(), Some("10.0.1.1/24"));
    assert_eq!(d2.interfaces[0].address.as_deref(), Some("10.0.1.2/24"));
    assert_eq!(d1.interfaces[0].name, "eth0");
    assert_eq!(link.subnet.as_deref(), Some("10.0.1.0/24"));

    assert!(common::ping(&topology, &h1, "10.0.1.2").await, "h1 -> h2");
    assert!(common::ping(&topology, &h2, "10.0.1.1").await, "h2 -> h1");

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn link_removal_rewinds_subnet_pool() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlb_c");
    let h2 = common::unique_device("nlb_d");

    topology.add_device(host_spec(&h1)).await.expect("h1");
    topology.add_device(host_spec(&h2)).await.expect("h2");

    let first = topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("first link");
    let first_subnet = first.subnet.clone();
    topology.remove_link(&first.id).await.expect("remove");

    let second = topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("second link");

    // Same subnet again, and the interface name is reused.
    assert_eq!(second.subnet, first_subnet);
    assert_eq!(second.a.iface, "eth0");

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_captures_output_and_exit_code() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let name = common::unique_device("nlb_ex");
    topology.add_device(host_spec(&name)).await.expect("add");

    // Mount namespaces are shared, so a host temp file is visible inside.
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("probe.txt");
    std::fs::write(&path, "payload-42\n").expect("write");

    let argv = vec!["cat".to_string(), path.to_string_lossy().into_owned()];
    let outcome = topology
        .exec(&name, &argv, std::time::Duration::from_secs(5))
        .await
        .expect("exec cat");
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "payload-42\n");

    let outcome = topology
        .exec(&name, &["false".to_string()], std::time::Duration::from_secs(5))
        .await
        .expect("exec false");
    assert_eq!(outcome.exit_code, Some(1));

    let err = topology
        .exec(&name, &[], std::time::Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind, netlab::ErrorKind::InvalidArgument);

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_device_name_is_rejected() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let name = common::unique_device("nlb_dup");

    topology.add_device(host_spec(&name)).await.expect("first");
    let err = topology.add_device(host_spec(&name)).await.unwrap_err();
    assert_eq!(err.kind, netlab::ErrorKind::AlreadyExists);

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn gateway_must_sit_on_a_connected_subnet() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlb_g1");
    let h2 = common::unique_device("nlb_g2");

    topology.add_device(host_spec(&h1)).await.expect("h1");
    topology.add_device(host_spec(&h2)).await.expect("h2");
    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("link");

    let err = topology
        .set_gateway(&h1, "192.168.99.1".parse().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind, netlab::ErrorKind::InvalidArgument);

    topology
        .set_gateway(&h1, "10.0.1.2".parse().unwrap())
        .await
        .expect("on-subnet gateway accepted");

    let view = topology.inspect(&h1).await.unwrap();
    assert!(
        view.routes.iter().any(|r| r.starts_with("default via 10.0.1.2")),
        "default route installed: {:?}",
        view.routes
    );

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hosts_reach_each_other_through_a_router() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlb_r1");
    let h2 = common::unique_device("nlb_r2");
    let r = common::unique_device("nlb_rr");

    topology.add_device(host_spec(&h1)).await.expect("h1");
    topology.add_device(host_spec(&h2)).await.expect("h2");
    topology
        .add_device(DeviceSpec {
            name: r.clone(),
            kind: DeviceKind::Router,
            x: None,
            y: None,
            addr: None,
        })
        .await
        .expect("router");

    // h1 -- r on 10.0.1.0/24, r -- h2 on 10.0.2.0/24.
    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: r.clone(),
            ..Default::default()
        })
        .await
        .expect("h1-r");
    topology
        .add_link(LinkSpec {
            device_a: r.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("r-h2");

    topology
        .set_gateway(&h1, "10.0.1.2".parse().unwrap())
        .await
        .expect("h1 gateway");
    topology
        .set_gateway(&h2, "10.0.2.1".parse().unwrap())
        .await
        .expect("h2 gateway");

    assert!(
        common::ping(&topology, &h1, "10.0.2.2").await,
        "h1 must reach h2 across the router"
    );

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_route_installs_gateways_and_routes() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlb_u1");
    let h2 = common::unique_device("nlb_u2");
    let r = common::unique_device("nlb_ur");

    topology.add_device(host_spec(&h1)).await.expect("h1");
    topology.add_device(host_spec(&h2)).await.expect("h2");
    topology
        .add_device(DeviceSpec {
            name: r.clone(),
            kind: DeviceKind::Router,
            x: None,
            y: None,
            addr: None,
        })
        .await
        .expect("router");
    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: r.clone(),
            ..Default::default()
        })
        .await
        .expect("h1-r");
    topology
        .add_link(LinkSpec {
            device_a: r.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("r-h2");

    let installed = topology.auto_route().await.expect("auto-route");
    assert!(installed >= 2, "expected at least both host gateways, got {installed}");

    assert!(
        common::ping(&topology, &h1, "10.0.2.2").await,
        "auto-routing must make h2 reachable from h1"
    );

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn switch_bridges_endpoints_onto_one_subnet() {
    if common::skip_without_deps() {
        return;
    }
    let topology = common::test_topology();
    let sw = common::unique_device("nlb_sw");
    let h1 = common::unique_device("nlb_s1");
    let h2 = common::unique_device("nlb_s2");

    topology
        .add_device(DeviceSpec {
            name: sw.clone(),
            kind: DeviceKind::Switch,
            x: None,
            y: None,
            addr: None,
        })
        .await
        .expect("switch");
    topology.add_device(host_spec(&h1)).await.expect("h1");
    topology.add_device(host_spec(&h2)).await.expect("h2");

    let l1 = topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: sw.clone(),
            ..Default::default()
        })
        .await
        .expect("h1-sw");
    let l2 = topology
        .add_link(LinkSpec {
            device_a: h2.clone(),
            device_b: sw.clone(),
            ..Default::default()
        })
        .await
        .expect("h2-sw");

    // Bridged endpoints share the switch's subnet.
    assert_eq!(l1.subnet, l2.subnet);

    let snap = topology.snapshot();
    let a1 = &snap.devices.iter().find(|d| d.name == h1).unwrap().interfaces[0];
    let a2 = &snap.devices.iter().find(|d| d.name == h2).unwrap().interfaces[0];
    let ip1 = a1.address.as_deref().unwrap().split('/').next().unwrap().to_string();
    let ip2 = a2.address.as_deref().unwrap().split('/').next().unwrap();

    assert!(common::ping(&topology, &h1, ip2).await, "{h1} -> {ip2} through bridge");
    assert!(common::ping(&topology, &h2, &ip1).await, "{h2} -> {ip1} through bridge");

    topology.cleanup().await;
}
