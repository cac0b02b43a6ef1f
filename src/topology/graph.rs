//! Device and link records.
//!
//! These are the control plane's own books — the kernel remains the source
//! of truth for live network state, but teardown ordering, address
//! ownership, and failure bookkeeping need a graph the kernel cannot give
//! back.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use netkit::ShapingSpec;

use crate::error::{EmuError, Result};

/// The bridge every switch owns inside its namespace.
pub const SWITCH_BRIDGE: &str = "br0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Host,
    Router,
    Switch,
    DnsServer,
}

impl DeviceKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(DeviceKind::Host),
            "router" => Ok(DeviceKind::Router),
            "switch" => Ok(DeviceKind::Switch),
            "dns_server" => Ok(DeviceKind::DnsServer),
            other => Err(EmuError::invalid(format!(
                "unknown device kind '{other}' (host|router|switch|dns_server)"
            ))),
        }
    }

    /// Routers forward; everything else must not.
    pub fn forwards(self) -> bool {
        matches!(self, DeviceKind::Router)
    }

    /// Switches own a bridge and no terminal; all other kinds get a
    /// pre-spawned shell session.
    pub fn interactive(self) -> bool {
        !matches!(self, DeviceKind::Switch)
    }
}

/// One interface the topology created on a device.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub addr: Option<Ipv4Addr>,
    pub prefix: u8,
    /// Shaping installed at link creation; failure verbs overlay this and
    /// clearing a failure restores it.
    pub baseline: ShapingSpec,
    pub link_id: Option<String>,
}

impl Interface {
    /// The /24 network this interface sits on, if addressed.
    pub fn network(&self) -> Option<(Ipv4Addr, u8)> {
        self.addr.map(|a| (mask_network(a, self.prefix), self.prefix))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        match self.network() {
            Some((net, prefix)) => mask_network(addr, prefix) == net,
            None => false,
        }
    }
}

pub fn mask_network(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    Ipv4Addr::from(u32::from(addr) & mask)
}

/// An injected failure currently active on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    InterfaceDown { iface: String },
    BlockIcmp,
    SilentRouter,
    PacketLoss { iface: String, pct: f32 },
    Latency { iface: String, ms: u32 },
    BandwidthLimit { iface: String, mbps: f64 },
}

impl Failure {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Failure::InterfaceDown { .. } => "interface_down",
            Failure::BlockIcmp => "block_icmp",
            Failure::SilentRouter => "silent_router",
            Failure::PacketLoss { .. } => "packet_loss",
            Failure::Latency { .. } => "latency",
            Failure::BandwidthLimit { .. } => "bandwidth_limit",
        }
    }

    pub fn iface(&self) -> Option<&str> {
        match self {
            Failure::InterfaceDown { iface }
            | Failure::PacketLoss { iface, .. }
            | Failure::Latency { iface, .. }
            | Failure::BandwidthLimit { iface, .. } => Some(iface),
            Failure::BlockIcmp | Failure::SilentRouter => None,
        }
    }

    /// At most one failure of each parametrized kind per interface:
    /// two failures collide when kind and target interface match.
    pub fn same_slot(&self, other: &Failure) -> bool {
        self.kind_name() == other.kind_name() && self.iface() == other.iface()
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub kind: DeviceKind,
    pub interfaces: SmallVec<Interface, 4>,
    pub default_gateway: Option<Ipv4Addr>,
    pub failures: Vec<Failure>,
    pub position: (i32, i32),
    /// Address requested at creation, applied to the first interface.
    pub pending_addr: Option<(Ipv4Addr, u8)>,
    /// Switches: the shared subnet all bridged endpoints draw from.
    pub switch_subnet: Option<u8>,
    /// Set while a removal is in flight; blocks new links and sessions.
    pub removing: bool,
}

impl Device {
    pub fn new(name: &str, kind: DeviceKind, position: (i32, i32)) -> Self {
        Self {
            name: name.to_string(),
            kind,
            interfaces: SmallVec::new(),
            default_gateway: None,
            failures: Vec::new(),
            position,
            pending_addr: None,
            switch_subnet: None,
            removing: false,
        }
    }

    /// Interface names follow link-creation order (`eth0`, `eth1`, …);
    /// the lowest free index is reused after a removal.
    pub fn next_iface_name(&self) -> String {
        for n in 0.. {
            let name = format!("eth{n}");
            if self.iface(&name).is_none() {
                return name;
            }
        }
        unreachable!()
    }

    pub fn iface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn iface_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.name == name)
    }

    /// First assigned address, used for hostname records.
    pub fn primary_addr(&self) -> Option<Ipv4Addr> {
        self.interfaces.iter().find_map(|i| i.addr)
    }

    /// The merged shaping for an interface: link baseline overlaid with any
    /// active parametrized failures targeting it.
    pub fn effective_shaping(&self, iface: &str) -> ShapingSpec {
        let mut spec = self
            .iface(iface)
            .map(|i| i.baseline)
            .unwrap_or_default();
        for failure in &self.failures {
            match failure {
                Failure::PacketLoss { iface: fi, pct } if fi == iface => {
                    spec.loss_pct = Some(*pct);
                }
                Failure::Latency { iface: fi, ms } if fi == iface => {
                    spec.latency_ms = Some(*ms);
                    spec.jitter_ms = None;
                }
                Failure::BandwidthLimit { iface: fi, mbps } if fi == iface => {
                    spec.bandwidth_mbps = Some(*mbps);
                }
                _ => {}
            }
        }
        spec
    }
}

/// Which realization a link has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    PointToPoint,
    Switched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub device: String,
    pub iface: String,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub id: String,
    pub kind: LinkKind,
    pub a: Endpoint,
    pub b: Endpoint,
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub bandwidth_mbps: Option<f64>,
    pub loss_pct: Option<f32>,
    /// `None` when both endpoints supplied their own addresses.
    pub subnet: Option<u8>,
    /// Whether this link allocated `subnet` (p2p) or borrowed a switch's.
    pub owns_subnet: bool,
}

impl Link {
    pub fn shaping(&self) -> ShapingSpec {
        ShapingSpec {
            latency_ms: self.latency_ms,
            jitter_ms: self.jitter_ms,
            loss_pct: self.loss_pct,
            bandwidth_mbps: self.bandwidth_mbps,
        }
    }

    pub fn touches(&self, device: &str) -> bool {
        self.a.device == device || self.b.device == device
    }
}
