//! Packet observer integration tests.
//!
//! A ping between two linked hosts must surface as typed events on the
//! global fan-out, with echo requests seen on the sender's interface.

mod common;

use std::time::Duration;

use netlab::{PacketKind, Protocol};
use netlab::topology::{DeviceKind, DeviceSpec, LinkSpec};
use tokio::sync::broadcast::error::RecvError;

#[tokio::test(flavor = "multi_thread")]
async fn ping_produces_echo_events_on_the_fanout() {
    if common::skip_without_tcpdump() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlo_a");
    let h2 = common::unique_device("nlo_b");

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

    let mut feed = topology.subscribe_packets();

    topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("link");

    // Give the capture processes a moment to come up before generating
    // the traffic we assert on.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(common::ping(&topology, &h1, "10.0.1.2").await, "ping");

    let mut saw_request_on_h1 = false;
    let mut saw_reply = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    while tokio::time::Instant::now() < deadline && !(saw_request_on_h1 && saw_reply) {
        let event = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = feed.recv() => event,
        };
        match event {
            Ok(event) => {
                if event.protocol != Protocol::Icmp {
                    continue;
                }
                if event.packet_type == PacketKind::IcmpEchoRequest && event.device == h1 {
                    assert_eq!(event.interface, "eth0");
                    assert_eq!(event.src_ip, Some("10.0.1.1".parse().unwrap()));
                    assert_eq!(event.dst_ip, Some("10.0.1.2".parse().unwrap()));
                    assert!(event.timestamp > 0.0);
                    saw_request_on_h1 = true;
                }
                if event.packet_type == PacketKind::IcmpEchoReply {
                    saw_reply = true;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }

    assert!(saw_request_on_h1, "no icmp_echo_request observed on {h1}:eth0");
    assert!(saw_reply, "no icmp_echo_reply observed");

    topology.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_a_link_stops_its_observers() {
    if common::skip_without_tcpdump() {
        return;
    }
    let topology = common::test_topology();
    let h1 = common::unique_device("nlo_c");
    let h2 = common::unique_device("nlo_d");

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
    let link = topology
        .add_link(LinkSpec {
            device_a: h1.clone(),
            device_b: h2.clone(),
            ..Default::default()
        })
        .await
        .expect("link");

    assert_eq!(topology.status().observers, 2);
    topology.remove_link(&link.id).await.expect("remove");
    assert_eq!(topology.status().observers, 0);

    topology.cleanup().await;
}
