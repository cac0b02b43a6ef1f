use std::net::Ipv4Addr;

use netkit::ShapingSpec;

use crate::topology::graph::{Device, DeviceKind, Failure, Interface, mask_network};

fn device_with_iface(addr: Ipv4Addr, baseline: ShapingSpec) -> Device {
    let mut dev = Device::new("h1", DeviceKind::Host, (0, 0));
    dev.interfaces.push(Interface {
        name: "eth0".to_string(),
        addr: Some(addr),
        prefix: 24,
        baseline,
        link_id: Some("link-1".to_string()),
    });
    dev
}

#[test]
fn kind_dispatch() {
    assert!(DeviceKind::Router.forwards());
    assert!(!DeviceKind::Host.forwards());
    assert!(!DeviceKind::Switch.interactive());
    assert!(DeviceKind::DnsServer.interactive());
    assert!(DeviceKind::parse("dns_server").is_ok());
    assert!(DeviceKind::parse("firewall").is_err());
}

#[test]
fn network_masking() {
    let addr = Ipv4Addr::new(10, 0, 3, 7);
    assert_eq!(mask_network(addr, 24), Ipv4Addr::new(10, 0, 3, 0));
    assert_eq!(mask_network(addr, 16), Ipv4Addr::new(10, 0, 0, 0));
    assert_eq!(mask_network(addr, 32), addr);
}

#[test]
fn interface_subnet_membership() {
    let dev = device_with_iface(Ipv4Addr::new(10, 0, 1, 1), ShapingSpec::default());
    let iface = dev.iface("eth0").unwrap();
    assert!(iface.contains(Ipv4Addr::new(10, 0, 1, 2)));
    assert!(!iface.contains(Ipv4Addr::new(10, 0, 2, 2)));
}

#[test]
fn iface_names_reuse_lowest_free_index() {
    let mut dev = device_with_iface(Ipv4Addr::new(10, 0, 1, 1), ShapingSpec::default());
    assert_eq!(dev.next_iface_name(), "eth1");
    dev.interfaces.clear();
    assert_eq!(dev.next_iface_name(), "eth0");
}

#[test]
fn failure_slots_collide_by_kind_and_iface() {
    let a = Failure::PacketLoss {
        iface: "eth0".into(),
        pct: 50.0,
    };
    let b = Failure::PacketLoss {
        iface: "eth0".into(),
        pct: 100.0,
    };
    let c = Failure::PacketLoss {
        iface: "eth1".into(),
        pct: 50.0,
    };
    let d = Failure::Latency {
        iface: "eth0".into(),
        ms: 10,
    };
    assert!(a.same_slot(&b));
    assert!(!a.same_slot(&c));
    assert!(!a.same_slot(&d));
    assert!(Failure::BlockIcmp.same_slot(&Failure::BlockIcmp));
}

#[test]
fn effective_shaping_overlays_baseline() {
    let baseline = ShapingSpec {
        latency_ms: Some(10),
        ..Default::default()
    };
    let mut dev = device_with_iface(Ipv4Addr::new(10, 0, 1, 1), baseline);

    // No failures: baseline passes through.
    assert_eq!(dev.effective_shaping("eth0").latency_ms, Some(10));

    dev.failures.push(Failure::PacketLoss {
        iface: "eth0".into(),
        pct: 100.0,
    });
    let merged = dev.effective_shaping("eth0");
    assert_eq!(merged.latency_ms, Some(10));
    assert_eq!(merged.loss_pct, Some(100.0));

    // Clearing the failure restores the pre-injection state.
    dev.failures.clear();
    assert_eq!(dev.effective_shaping("eth0"), baseline);
}

#[test]
fn latency_failure_replaces_baseline_delay() {
    let baseline = ShapingSpec {
        latency_ms: Some(10),
        jitter_ms: Some(2),
        ..Default::default()
    };
    let mut dev = device_with_iface(Ipv4Addr::new(10, 0, 1, 1), baseline);
    dev.failures.push(Failure::Latency {
        iface: "eth0".into(),
        ms: 200,
    });
    let merged = dev.effective_shaping("eth0");
    assert_eq!(merged.latency_ms, Some(200));
    assert_eq!(merged.jitter_ms, None);
}

#[test]
fn failure_serialization_is_tagged() {
    let failure = Failure::PacketLoss {
        iface: "eth0".into(),
        pct: 25.0,
    };
    let json = serde_json::to_value(&failure).unwrap();
    assert_eq!(json["kind"], "packet_loss");
    assert_eq!(json["iface"], "eth0");
    assert_eq!(json["pct"], 25.0);

    let json = serde_json::to_value(Failure::SilentRouter).unwrap();
    assert_eq!(json["kind"], "silent_router");
}
