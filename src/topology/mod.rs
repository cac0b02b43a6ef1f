//! Topology orchestration.
//!
//! The only component that sees the whole graph. Client intents become
//! sequenced calls into `netkit`; device and link records, subnet and
//! address allocation, failure bookkeeping, and teardown ordering all live
//! here. Mutations on one device are linearized by a per-device lock; link
//! operations take both endpoint locks in name order so disjoint devices
//! proceed in parallel without deadlock.

pub mod allocator;
pub mod graph;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, broadcast};
use tracing::{debug, info, warn};

use netkit::{Netns, ShapingSpec, link as netlink, shaping};

use crate::error::{EmuError, Result};
use crate::events::EventSender;
use crate::exec::{self, ExecOutcome};
use crate::observer::{ObserverManager, PacketEvent};
use crate::pty::{PtyManager, PtySession};

pub use allocator::{AddressRegistry, SubnetAllocator};
pub use graph::{
    Device, DeviceKind, Endpoint, Failure, Interface, Link, LinkKind, SWITCH_BRIDGE, mask_network,
};

const MAX_DEVICE_NAME: usize = 32;

// ---------------------------------------------------------------------------
// Views returned to the control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct IfaceSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub kind: DeviceKind,
    pub x: i32,
    pub y: i32,
    pub interfaces: Vec<IfaceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_gateway: Option<Ipv4Addr>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub id: String,
    pub kind: LinkKind,
    pub a: Endpoint,
    pub b: Endpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss_pct: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveIface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub addresses: Vec<String>,
    pub up: bool,
}

/// Merged inspect view: control-plane records plus kernel read-through.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub summary: DeviceSummary,
    pub live_interfaces: Vec<LiveIface>,
    pub routes: Vec<String>,
    pub arp: Vec<String>,
    pub sockets: Vec<String>,
    pub forwarding: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub devices: Vec<DeviceSummary>,
    pub links: Vec<LinkSummary>,
    /// hostname → primary address, for name resolution inside the lab
    pub hosts: BTreeMap<String, Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub devices: usize,
    pub links: usize,
    pub sessions: usize,
    pub observers: usize,
    pub malformed_capture_records: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub device: String,
    #[serde(flatten)]
    pub failure: Failure,
}

/// Inputs for device creation (already parsed and typed).
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub addr: Option<(Ipv4Addr, u8)>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkSpec {
    pub device_a: String,
    pub device_b: String,
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub bandwidth_mbps: Option<f64>,
    pub loss_pct: Option<f32>,
}

impl LinkSpec {
    fn shaping(&self) -> ShapingSpec {
        ShapingSpec {
            latency_ms: self.latency_ms,
            jitter_ms: self.jitter_ms,
            loss_pct: self.loss_pct,
            bandwidth_mbps: self.bandwidth_mbps,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-device locks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeviceLocks {
    inner: StdMutex<FxHashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeviceLocks {
    fn handle(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        self.handle(name).lock_owned().await
    }

    /// Both endpoint locks, always acquired in name order.
    async fn lock_pair(&self, a: &str, b: &str) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        if a <= b {
            let ga = self.handle(a).lock_owned().await;
            let gb = self.handle(b).lock_owned().await;
            (ga, gb)
        } else {
            let gb = self.handle(b).lock_owned().await;
            let ga = self.handle(a).lock_owned().await;
            (ga, gb)
        }
    }

    fn forget(&self, name: &str) {
        self.inner.lock().unwrap().remove(name);
    }
}

// ---------------------------------------------------------------------------
// Rollback guard
// ---------------------------------------------------------------------------

/// Undo actions for a partially-applied mutation, run in reverse order when
/// the guard drops still armed. Because the guard fires from `Drop`, it
/// also unwinds operations cancelled by a deadline.
enum Undo {
    DeleteNamespace(String),
    DeleteIface { ns: String, iface: String },
    ReleaseAddr(Ipv4Addr),
    ReleaseSubnet(u8),
    UnsetSwitchSubnet(String),
    StopObserver { device: String, iface: String },
    RestorePending { device: String, addr: Ipv4Addr, prefix: u8 },
}

struct Rollback {
    topo: Arc<Topology>,
    undo: Vec<Undo>,
    armed: bool,
}

impl Rollback {
    fn new(topo: Arc<Topology>) -> Self {
        Self {
            topo,
            undo: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, action: Undo) {
        self.undo.push(action);
    }

    fn disarm(mut self) {
        self.armed = false;
        self.undo.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.armed || self.undo.is_empty() {
            return;
        }
        let topo = self.topo.clone();
        let actions: Vec<Undo> = self.undo.drain(..).collect();
        tokio::spawn(async move {
            warn!("rolling back {} partial actions", actions.len());
            for action in actions.into_iter().rev() {
                match action {
                    Undo::DeleteNamespace(name) => {
                        netkit::namespace::delete_quietly(&name).await;
                    }
                    Undo::DeleteIface { ns, iface } => {
                        let _ = netlink::delete_iface(&Netns::attach(&ns), &iface).await;
                    }
                    Undo::ReleaseAddr(addr) => {
                        topo.registry.lock().unwrap().release(addr);
                    }
                    Undo::ReleaseSubnet(n) => {
                        topo.alloc.lock().unwrap().release(n);
                    }
                    Undo::UnsetSwitchSubnet(device) => {
                        if let Some(dev) = topo.devices.lock().unwrap().get_mut(&device) {
                            dev.switch_subnet = None;
                        }
                    }
                    Undo::StopObserver { device, iface } => {
                        topo.observers.stop(&device, &iface);
                    }
                    Undo::RestorePending { device, addr, prefix } => {
                        if let Some(dev) = topo.devices.lock().unwrap().get_mut(&device) {
                            dev.pending_addr = Some((addr, prefix));
                        }
                    }
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

pub struct Topology {
    devices: StdMutex<FxHashMap<String, Device>>,
    links: StdMutex<FxHashMap<String, Link>>,
    locks: DeviceLocks,
    alloc: StdMutex<SubnetAllocator>,
    registry: StdMutex<AddressRegistry>,
    ptys: Arc<PtyManager>,
    observers: Arc<ObserverManager>,
    link_seq: AtomicU64,
}

impl Topology {
    pub fn new(events: EventSender, terminal_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            devices: StdMutex::new(FxHashMap::default()),
            links: StdMutex::new(FxHashMap::default()),
            locks: DeviceLocks::default(),
            alloc: StdMutex::new(SubnetAllocator::new()),
            registry: StdMutex::new(AddressRegistry::default()),
            ptys: PtyManager::new(events.clone(), terminal_grace),
            observers: ObserverManager::new(events),
            link_seq: AtomicU64::new(1),
        })
    }

    pub fn ptys(&self) -> &Arc<PtyManager> {
        &self.ptys
    }

    pub fn subscribe_packets(&self) -> broadcast::Receiver<Arc<PacketEvent>> {
        self.observers.subscribe()
    }

    // -- devices -----------------------------------------------------------

    pub async fn add_device(self: &Arc<Self>, spec: DeviceSpec) -> Result<DeviceSummary> {
        validate_device_name(&spec.name)?;
        let _guard = self.locks.lock(&spec.name).await;

        if self.devices.lock().unwrap().contains_key(&spec.name) {
            return Err(EmuError::already_exists(format!("device '{}'", spec.name)));
        }

        let mut rollback = Rollback::new(self.clone());

        // A requested address is claimed up front (it will land on eth0)
        // so conflicts surface before any kernel state exists.
        if let Some((addr, prefix)) = spec.addr {
            if prefix == 0 || prefix > 32 {
                return Err(EmuError::invalid(format!("prefix /{prefix}")));
            }
            self.registry
                .lock()
                .unwrap()
                .claim(addr, &spec.name, "eth0")?;
            rollback.push(Undo::ReleaseAddr(addr));
        }

        let ns = Netns::create(&spec.name).await?;
        rollback.push(Undo::DeleteNamespace(spec.name.clone()));

        if spec.kind.forwards() {
            ns.set_forwarding(true).await?;
        }
        if spec.kind == DeviceKind::Switch {
            netlink::create_bridge(&ns, SWITCH_BRIDGE).await?;
        }

        let mut device = Device::new(
            &spec.name,
            spec.kind,
            (spec.x.unwrap_or(400), spec.y.unwrap_or(300)),
        );
        device.pending_addr = spec.addr;

        // Pre-spawn the default terminal for interactive kinds; a failed
        // shell is not fatal to device creation.
        if spec.kind.interactive()
            && let Err(e) = self.ptys.open(&spec.name, "default", &spec.name, 24, 80)
        {
            warn!(device = spec.name, error = %e, "pre-spawning terminal failed");
        }

        let summary = summarize(&device);
        self.devices
            .lock()
            .unwrap()
            .insert(spec.name.clone(), device);
        rollback.disarm();

        info!(device = spec.name, kind = ?spec.kind, "device added");
        self.refresh_resolv_conf().await;
        Ok(summary)
    }

    /// Remove a device and everything that depends on it, in order:
    /// links, then sessions, then observers, then the namespace.
    /// Idempotent: an unknown device is success.
    pub async fn remove_device(self: &Arc<Self>, name: &str) -> Result<()> {
        // Mark first so concurrent add_link/open_terminal stop targeting it.
        {
            let mut devices = self.devices.lock().unwrap();
            match devices.get_mut(name) {
                Some(dev) => dev.removing = true,
                None => return Ok(()),
            }
        }

        // Dependent links go first; each takes both endpoint locks itself,
        // so the device lock is only acquired once no link references the
        // device anymore. An add_link that won the race before the
        // `removing` mark is caught by the re-check under the lock.
        let _guard = loop {
            let dependent: Vec<String> = {
                let links = self.links.lock().unwrap();
                links
                    .values()
                    .filter(|l| l.touches(name))
                    .map(|l| l.id.clone())
                    .collect()
            };
            for id in dependent {
                if let Err(e) = self.remove_link(&id).await {
                    warn!(link = id, error = %e, "removing dependent link failed");
                }
            }

            let guard = self.locks.lock(name).await;
            let clear = {
                let links = self.links.lock().unwrap();
                !links.values().any(|l| l.touches(name))
            };
            if clear {
                break guard;
            }
            drop(guard);
        };

        self.ptys.close_device(name).await;
        self.observers.stop_device(name);

        let removed = self.devices.lock().unwrap().remove(name);
        if let Some(device) = removed {
            if let Some(subnet) = device.switch_subnet {
                self.alloc.lock().unwrap().release(subnet);
            }
            self.registry.lock().unwrap().release_device(name);
        }

        Netns::delete(name).await?;
        let _ = tokio::fs::remove_dir_all(resolv_dir(name)).await;

        drop(_guard);
        self.locks.forget(name);

        info!(device = name, "device removed");
        self.refresh_resolv_conf().await;
        Ok(())
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        let devices = self.devices.lock().unwrap();
        let mut out: Vec<DeviceSummary> = devices.values().map(summarize).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Merged control-plane + kernel view of one device.
    pub async fn inspect(&self, name: &str) -> Result<DeviceView> {
        let (summary, kind) = {
            let devices = self.devices.lock().unwrap();
            let device = devices
                .get(name)
                .ok_or_else(|| EmuError::not_found(format!("device '{name}'")))?;
            (summarize(device), device.kind)
        };

        let ns = Netns::attach(name);
        let view = ns.view().await?;
        let sockets = ns.sockets().await.unwrap_or_default();

        // A switch forwards at L2; its "routing table" is the bridge FDB.
        let routes = if kind == DeviceKind::Switch {
            netlink::bridge_fdb(&ns, SWITCH_BRIDGE).await.unwrap_or_default()
        } else {
            view.routes
        };

        Ok(DeviceView {
            summary,
            live_interfaces: view
                .interfaces
                .into_iter()
                .map(|i| LiveIface {
                    name: i.name,
                    mac: i.mac,
                    addresses: i.addresses,
                    up: i.up,
                })
                .collect(),
            routes,
            arp: view.arp,
            sockets,
            forwarding: view.forwarding,
        })
    }

    // -- links -------------------------------------------------------------

    pub async fn add_link(self: &Arc<Self>, spec: LinkSpec) -> Result<LinkSummary> {
        if spec.device_a == spec.device_b {
            return Err(EmuError::invalid("cannot link a device to itself"));
        }
        spec.shaping().validate()?;

        let (_ga, _gb) = self.locks.lock_pair(&spec.device_a, &spec.device_b).await;

        let (kind_a, kind_b) = {
            let devices = self.devices.lock().unwrap();
            let a = live_device(&devices, &spec.device_a)?;
            let b = live_device(&devices, &spec.device_b)?;
            (a.kind, b.kind)
        };

        if kind_a == DeviceKind::Switch && kind_b == DeviceKind::Switch {
            return Err(EmuError::invalid("switch-to-switch links are not supported"));
        }

        let id = format!("link-{}", self.link_seq.fetch_add(1, Ordering::Relaxed));
        if kind_a == DeviceKind::Switch || kind_b == DeviceKind::Switch {
            let (switch, endpoint) = if kind_a == DeviceKind::Switch {
                (spec.device_a.clone(), spec.device_b.clone())
            } else {
                (spec.device_b.clone(), spec.device_a.clone())
            };
            self.add_switched_link(id, switch, endpoint, spec).await
        } else {
            self.add_p2p_link(id, spec).await
        }
    }

    /// Point-to-point: fresh /24 (unless both ends brought addresses),
    /// `.1` to the first-named device, `.2` to the second.
    async fn add_p2p_link(self: &Arc<Self>, id: String, spec: LinkSpec) -> Result<LinkSummary> {
        let mut rollback = Rollback::new(self.clone());

        let (iface_a, pending_a) = self.prepare_endpoint(&spec.device_a);
        let (iface_b, pending_b) = self.prepare_endpoint(&spec.device_b);
        for (device, pending) in [(&spec.device_a, pending_a), (&spec.device_b, pending_b)] {
            if let Some((addr, prefix)) = pending {
                rollback.push(Undo::RestorePending {
                    device: device.clone(),
                    addr,
                    prefix,
                });
            }
        }

        let (subnet, addr_a, prefix_a, addr_b, prefix_b) = match (pending_a, pending_b) {
            (Some((a, pa)), Some((b, pb))) => (None, a, pa, b, pb),
            _ => {
                let subnet = self.alloc.lock().unwrap().allocate()?;
                rollback.push(Undo::ReleaseSubnet(subnet));
                let mut alloc = self.alloc.lock().unwrap();
                let a = match pending_a {
                    Some((a, p)) => (a, p),
                    None => (alloc.allocate_host(subnet)?, 24),
                };
                let b = match pending_b {
                    Some((b, p)) => (b, p),
                    None => (alloc.allocate_host(subnet)?, 24),
                };
                drop(alloc);
                (Some(subnet), a.0, a.1, b.0, b.1)
            }
        };

        // Claim allocator-assigned addresses; requested ones are already
        // claimed since device creation.
        for (addr, device, iface, pending) in [
            (addr_a, &spec.device_a, &iface_a, pending_a.is_some()),
            (addr_b, &spec.device_b, &iface_b, pending_b.is_some()),
        ] {
            if !pending {
                self.registry.lock().unwrap().claim(addr, device, iface)?;
                rollback.push(Undo::ReleaseAddr(addr));
            }
        }

        let ns_a = Netns::attach(&spec.device_a);
        let ns_b = Netns::attach(&spec.device_b);

        netlink::create_p2p(&ns_a, &iface_a, &ns_b, &iface_b).await?;
        rollback.push(Undo::DeleteIface {
            ns: spec.device_a.clone(),
            iface: iface_a.clone(),
        });

        ns_a.assign_address(&iface_a, addr_a, prefix_a).await?;
        ns_b.assign_address(&iface_b, addr_b, prefix_b).await?;

        let shape = spec.shaping();
        if !shape.is_empty() {
            shaping::apply(&ns_a, &iface_a, shape).await?;
            shaping::apply(&ns_b, &iface_b, shape).await?;
        }

        self.observers.start(&spec.device_a, &iface_a);
        rollback.push(Undo::StopObserver {
            device: spec.device_a.clone(),
            iface: iface_a.clone(),
        });
        self.observers.start(&spec.device_b, &iface_b);
        rollback.push(Undo::StopObserver {
            device: spec.device_b.clone(),
            iface: iface_b.clone(),
        });

        let link = Link {
            id: id.clone(),
            kind: LinkKind::PointToPoint,
            a: Endpoint {
                device: spec.device_a.clone(),
                iface: iface_a.clone(),
            },
            b: Endpoint {
                device: spec.device_b.clone(),
                iface: iface_b.clone(),
            },
            latency_ms: spec.latency_ms,
            jitter_ms: spec.jitter_ms,
            bandwidth_mbps: spec.bandwidth_mbps,
            loss_pct: spec.loss_pct,
            subnet,
            owns_subnet: subnet.is_some(),
        };

        self.commit_link(&link, &[
            (spec.device_a.as_str(), iface_a.as_str(), addr_a, prefix_a),
            (spec.device_b.as_str(), iface_b.as_str(), addr_b, prefix_b),
        ]);
        rollback.disarm();

        info!(
            link = id,
            a = format!("{}:{iface_a}", spec.device_a),
            b = format!("{}:{iface_b}", spec.device_b),
            "p2p link added"
        );
        self.refresh_resolv_conf().await;
        Ok(self.summarize_link(&id).expect("link just recorded"))
    }

    /// Switched: all endpoints of one switch share its subnet; the switch
    /// bridge takes the first host address as a management address.
    async fn add_switched_link(
        self: &Arc<Self>,
        id: String,
        switch: String,
        endpoint: String,
        spec: LinkSpec,
    ) -> Result<LinkSummary> {
        let mut rollback = Rollback::new(self.clone());

        let switch_ns = Netns::attach(&switch);
        let endpoint_ns = Netns::attach(&endpoint);

        let (subnet, fresh_subnet) = {
            let devices = self.devices.lock().unwrap();
            match live_device(&devices, &switch)?.switch_subnet {
                Some(n) => (n, false),
                None => {
                    drop(devices);
                    let n = self.alloc.lock().unwrap().allocate()?;
                    rollback.push(Undo::ReleaseSubnet(n));
                    self.devices
                        .lock()
                        .unwrap()
                        .get_mut(&switch)
                        .ok_or_else(|| EmuError::not_found(format!("device '{switch}'")))?
                        .switch_subnet = Some(n);
                    rollback.push(Undo::UnsetSwitchSubnet(switch.clone()));
                    (n, true)
                }
            }
        };

        if fresh_subnet {
            let mgmt = self.alloc.lock().unwrap().allocate_host(subnet)?;
            self.registry
                .lock()
                .unwrap()
                .claim(mgmt, &switch, SWITCH_BRIDGE)?;
            rollback.push(Undo::ReleaseAddr(mgmt));
            switch_ns.assign_address(SWITCH_BRIDGE, mgmt, 24).await?;
            let mut devices = self.devices.lock().unwrap();
            if let Some(dev) = devices.get_mut(&switch) {
                dev.interfaces.push(Interface {
                    name: SWITCH_BRIDGE.to_string(),
                    addr: Some(mgmt),
                    prefix: 24,
                    baseline: ShapingSpec::default(),
                    link_id: None,
                });
            }
        }

        let (endpoint_iface, pending) = self.prepare_endpoint(&endpoint);
        let (port_iface, _) = self.prepare_endpoint(&switch);
        if let Some((addr, prefix)) = pending {
            rollback.push(Undo::RestorePending {
                device: endpoint.clone(),
                addr,
                prefix,
            });
        }

        let (addr, prefix) = match pending {
            Some((a, p)) => (a, p),
            None => (self.alloc.lock().unwrap().allocate_host(subnet)?, 24),
        };
        if pending.is_none() {
            self.registry
                .lock()
                .unwrap()
                .claim(addr, &endpoint, &endpoint_iface)?;
            rollback.push(Undo::ReleaseAddr(addr));
        }

        netlink::create_switched(
            &endpoint_ns,
            &endpoint_iface,
            &switch_ns,
            &port_iface,
            SWITCH_BRIDGE,
        )
        .await?;
        rollback.push(Undo::DeleteIface {
            ns: endpoint.clone(),
            iface: endpoint_iface.clone(),
        });

        endpoint_ns
            .assign_address(&endpoint_iface, addr, prefix)
            .await?;

        let shape = spec.shaping();
        if !shape.is_empty() {
            shaping::apply(&endpoint_ns, &endpoint_iface, shape).await?;
        }

        self.observers.start(&endpoint, &endpoint_iface);
        rollback.push(Undo::StopObserver {
            device: endpoint.clone(),
            iface: endpoint_iface.clone(),
        });

        let link = Link {
            id: id.clone(),
            kind: LinkKind::Switched,
            a: Endpoint {
                device: endpoint.clone(),
                iface: endpoint_iface.clone(),
            },
            b: Endpoint {
                device: switch.clone(),
                iface: port_iface.clone(),
            },
            latency_ms: spec.latency_ms,
            jitter_ms: spec.jitter_ms,
            bandwidth_mbps: spec.bandwidth_mbps,
            loss_pct: spec.loss_pct,
            subnet: Some(subnet),
            owns_subnet: false,
        };

        self.commit_link(&link, &[(endpoint.as_str(), endpoint_iface.as_str(), addr, prefix)]);
        // The switch-side port is recorded without an address.
        {
            let mut devices = self.devices.lock().unwrap();
            if let Some(dev) = devices.get_mut(&switch) {
                dev.interfaces.push(Interface {
                    name: port_iface.clone(),
                    addr: None,
                    prefix: 0,
                    baseline: ShapingSpec::default(),
                    link_id: Some(id.clone()),
                });
            }
        }
        rollback.disarm();

        info!(
            link = id,
            endpoint = format!("{endpoint}:{endpoint_iface}"),
            switch,
            "switched link added"
        );
        self.refresh_resolv_conf().await;
        Ok(self.summarize_link(&id).expect("link just recorded"))
    }

    /// Replace shaping on a link (both ends for p2p).
    pub async fn update_link(
        self: &Arc<Self>,
        id: &str,
        params: ShapingSpec,
    ) -> Result<LinkSummary> {
        params.validate()?;
        let (a, b, kind) = {
            let links = self.links.lock().unwrap();
            let link = links
                .get(id)
                .ok_or_else(|| EmuError::not_found(format!("link '{id}'")))?;
            (link.a.clone(), link.b.clone(), link.kind)
        };

        let (_ga, _gb) = self.locks.lock_pair(&a.device, &b.device).await;

        {
            let mut links = self.links.lock().unwrap();
            let link = links
                .get_mut(id)
                .ok_or_else(|| EmuError::not_found(format!("link '{id}'")))?;
            link.latency_ms = params.latency_ms;
            link.jitter_ms = params.jitter_ms;
            link.loss_pct = params.loss_pct;
            link.bandwidth_mbps = params.bandwidth_mbps;
        }

        // New baseline; re-derive the effective qdisc per endpoint so any
        // active failure overlays survive the update.
        let mut ends = vec![(a.device.clone(), a.iface.clone())];
        if kind == LinkKind::PointToPoint {
            ends.push((b.device.clone(), b.iface.clone()));
        }
        for (device, iface) in ends {
            let effective = {
                let mut devices = self.devices.lock().unwrap();
                let dev = devices
                    .get_mut(&device)
                    .ok_or_else(|| EmuError::not_found(format!("device '{device}'")))?;
                if let Some(i) = dev.iface_mut(&iface) {
                    i.baseline = params;
                }
                dev.effective_shaping(&iface)
            };
            shaping::apply(&Netns::attach(&device), &iface, effective).await?;
        }

        info!(link = id, "link shaping updated");
        self.summarize_link(id)
            .ok_or_else(|| EmuError::not_found(format!("link '{id}'")))
    }

    /// Remove a link: observers, qdiscs, the veth pair (both ends), the
    /// address assignments, and — for p2p — the subnet. Idempotent.
    pub async fn remove_link(self: &Arc<Self>, id: &str) -> Result<()> {
        let link = {
            let links = self.links.lock().unwrap();
            match links.get(id) {
                Some(l) => l.clone(),
                None => return Ok(()),
            }
        };

        let (_ga, _gb) = self.locks.lock_pair(&link.a.device, &link.b.device).await;

        // Re-check under the locks; a concurrent remove may have won.
        if self.links.lock().unwrap().remove(id).is_none() {
            return Ok(());
        }

        self.observers.stop(&link.a.device, &link.a.iface);
        if link.kind == LinkKind::PointToPoint {
            self.observers.stop(&link.b.device, &link.b.iface);
        }

        // Deleting the endpoint-side interface removes the peer too.
        let ns_a = Netns::attach(&link.a.device);
        if let Err(e) = netlink::delete_iface(&ns_a, &link.a.iface).await {
            warn!(link = id, error = %e, "deleting link interface failed");
        }

        let mut devices = self.devices.lock().unwrap();
        let mut registry = self.registry.lock().unwrap();
        for end in [&link.a, &link.b] {
            if let Some(dev) = devices.get_mut(&end.device) {
                if let Some(pos) = dev.interfaces.iter().position(|i| i.name == end.iface) {
                    let iface = dev.interfaces.remove(pos);
                    if let Some(addr) = iface.addr {
                        registry.release(addr);
                    }
                }
                dev.failures
                    .retain(|f| f.iface().is_none_or(|fi| fi != end.iface));
            }
        }
        drop(registry);
        drop(devices);

        if link.owns_subnet
            && let Some(subnet) = link.subnet
        {
            self.alloc.lock().unwrap().release(subnet);
        }

        info!(link = id, "link removed");
        Ok(())
    }

    pub fn list_links(&self) -> Vec<LinkSummary> {
        let links = self.links.lock().unwrap();
        let mut out: Vec<LinkSummary> = links.values().map(link_summary).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    // -- gateway and failures ----------------------------------------------

    /// Set the default gateway; the address must sit on a subnet one of
    /// the device's interfaces is addressed in.
    pub async fn set_gateway(&self, device: &str, gw: Ipv4Addr) -> Result<()> {
        let _guard = self.locks.lock(device).await;

        {
            let devices = self.devices.lock().unwrap();
            let dev = live_device(&devices, device)?;
            if !dev.interfaces.iter().any(|i| i.contains(gw)) {
                return Err(EmuError::invalid(format!(
                    "gateway {gw} is not on any subnet of device '{device}'"
                )));
            }
        }

        Netns::attach(device).set_default_gateway(gw).await?;

        if let Some(dev) = self.devices.lock().unwrap().get_mut(device) {
            dev.default_gateway = Some(gw);
        }
        info!(device, %gw, "default gateway set");
        Ok(())
    }

    pub async fn inject_failure(&self, device: &str, failure: Failure) -> Result<()> {
        let _guard = self.locks.lock(device).await;

        {
            let devices = self.devices.lock().unwrap();
            let dev = live_device(&devices, device)?;
            if let Some(iface) = failure.iface()
                && dev.iface(iface).is_none()
            {
                return Err(EmuError::not_found(format!(
                    "interface '{iface}' on device '{device}'"
                )));
            }
            if matches!(failure, Failure::SilentRouter) && dev.kind != DeviceKind::Router {
                return Err(EmuError::invalid(format!(
                    "device '{device}' is not a router"
                )));
            }
            validate_failure(&failure)?;
        }

        let ns = Netns::attach(device);
        match &failure {
            Failure::InterfaceDown { iface } => ns.set_link_state(iface, false).await?,
            Failure::BlockIcmp => ns.block_icmp().await?,
            Failure::SilentRouter => ns.silence_router().await?,
            Failure::PacketLoss { iface, .. }
            | Failure::Latency { iface, .. }
            | Failure::BandwidthLimit { iface, .. } => {
                let effective = {
                    let mut devices = self.devices.lock().unwrap();
                    let dev = devices
                        .get_mut(device)
                        .ok_or_else(|| EmuError::not_found(format!("device '{device}'")))?;
                    dev.failures.retain(|f| !f.same_slot(&failure));
                    dev.failures.push(failure.clone());
                    dev.effective_shaping(iface)
                };
                shaping::apply(&ns, iface, effective).await?;
                info!(device, kind = failure.kind_name(), "failure injected");
                return Ok(());
            }
        }

        // Non-shaping verbs record after the kernel call succeeded.
        if let Some(dev) = self.devices.lock().unwrap().get_mut(device) {
            dev.failures.retain(|f| !f.same_slot(&failure));
            dev.failures.push(failure.clone());
        }
        info!(device, kind = failure.kind_name(), "failure injected");
        Ok(())
    }

    /// Clear failures of `kind` (optionally narrowed to one interface).
    /// Idempotent when nothing matches.
    pub async fn clear_failure(
        &self,
        device: &str,
        kind: &str,
        iface: Option<&str>,
    ) -> Result<()> {
        let _guard = self.locks.lock(device).await;

        let cleared: Vec<Failure> = {
            let mut devices = self.devices.lock().unwrap();
            let dev = devices
                .get_mut(device)
                .ok_or_else(|| EmuError::not_found(format!("device '{device}'")))?;
            let (matched, kept): (Vec<Failure>, Vec<Failure>) =
                dev.failures.drain(..).partition(|f| {
                    f.kind_name() == kind && iface.is_none_or(|i| f.iface() == Some(i))
                });
            dev.failures = kept;
            matched
        };

        let ns = Netns::attach(device);
        for failure in &cleared {
            match failure {
                Failure::InterfaceDown { iface } => ns.set_link_state(iface, true).await?,
                Failure::BlockIcmp => ns.unblock_icmp().await?,
                Failure::SilentRouter => ns.unsilence_router().await?,
                Failure::PacketLoss { iface, .. }
                | Failure::Latency { iface, .. }
                | Failure::BandwidthLimit { iface, .. } => {
                    let effective = {
                        let devices = self.devices.lock().unwrap();
                        live_device(&devices, device)?.effective_shaping(iface)
                    };
                    shaping::apply(&ns, iface, effective).await?;
                }
            }
        }

        if !cleared.is_empty() {
            info!(device, kind, cleared = cleared.len(), "failure cleared");
        }
        Ok(())
    }

    pub fn list_failures(&self) -> Vec<FailureReport> {
        let devices = self.devices.lock().unwrap();
        let mut out = Vec::new();
        for dev in devices.values() {
            for failure in &dev.failures {
                out.push(FailureReport {
                    device: dev.name.clone(),
                    failure: failure.clone(),
                });
            }
        }
        out.sort_by(|a, b| a.device.cmp(&b.device));
        out
    }

    // -- terminals, exec, snapshot -----------------------------------------

    /// Look up or create the PTY session backing a terminal channel.
    pub fn open_terminal(
        &self,
        device: &str,
        channel: &str,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<PtySession>> {
        {
            let devices = self.devices.lock().unwrap();
            let dev = live_device(&devices, device)?;
            if !dev.kind.interactive() {
                return Err(EmuError::invalid(format!(
                    "device '{device}' is a switch and has no terminal"
                )));
            }
        }
        self.ptys.open_or_get(device, channel, device, rows, cols)
    }

    /// One-shot argv execution inside a device's namespace.
    pub async fn exec(
        &self,
        device: &str,
        argv: &[String],
        deadline: Duration,
    ) -> Result<ExecOutcome> {
        {
            let devices = self.devices.lock().unwrap();
            live_device(&devices, device)?;
        }
        exec::run_in_namespace(device, argv, deadline).await
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            devices: self.list_devices(),
            links: self.list_links(),
            hosts: self.hostname_records(),
        }
    }

    pub fn status(&self) -> StatusView {
        StatusView {
            devices: self.devices.lock().unwrap().len(),
            links: self.links.lock().unwrap().len(),
            sessions: self.ptys.count(),
            observers: self.observers.count(),
            malformed_capture_records: self.observers.malformed_records(),
        }
    }

    // -- routing -----------------------------------------------------------

    /// Install static routes (and host default gateways) so every subnet
    /// is reachable through the recorded router graph. Forwarding itself
    /// stays in the kernel; this only writes routing tables.
    pub async fn auto_route(self: &Arc<Self>) -> Result<usize> {
        // subnet -> [(device, addr, is_router)]
        let mut members: BTreeMap<Ipv4Addr, Vec<(String, Ipv4Addr, bool)>> = BTreeMap::new();
        let mut targets: Vec<(String, DeviceKind)> = Vec::new();
        {
            let devices = self.devices.lock().unwrap();
            for dev in devices.values() {
                if dev.kind != DeviceKind::Switch {
                    targets.push((dev.name.clone(), dev.kind));
                }
                for iface in &dev.interfaces {
                    if let (Some(addr), Some((net, _))) = (iface.addr, iface.network()) {
                        members.entry(net).or_default().push((
                            dev.name.clone(),
                            addr,
                            dev.kind == DeviceKind::Router,
                        ));
                    }
                }
            }
        }

        let subnets_of = |device: &str| -> Vec<Ipv4Addr> {
            members
                .iter()
                .filter(|(_, m)| m.iter().any(|(d, _, _)| d == device))
                .map(|(net, _)| *net)
                .collect()
        };

        let mut installed = 0usize;
        for (src, kind) in &targets {
            let direct: Vec<Ipv4Addr> = subnets_of(src);

            // BFS over routers, remembering the first hop out of `src`.
            let mut visited: Vec<String> = vec![src.clone()];
            let mut queue: Vec<(String, Ipv4Addr)> = Vec::new();
            for net in &direct {
                for (router, addr, is_router) in &members[net] {
                    if *is_router && router != src && !visited.contains(router) {
                        visited.push(router.clone());
                        queue.push((router.clone(), *addr));
                    }
                }
            }

            let mut learned: BTreeMap<Ipv4Addr, Ipv4Addr> = BTreeMap::new();
            let mut cursor = 0;
            while cursor < queue.len() {
                let (router, first_hop) = queue[cursor].clone();
                cursor += 1;
                for net in subnets_of(&router) {
                    if !direct.contains(&net) {
                        learned.entry(net).or_insert(first_hop);
                    }
                    for (next, _addr, is_router) in &members[&net] {
                        if *is_router && !visited.contains(next) {
                            visited.push(next.clone());
                            queue.push((next.clone(), first_hop));
                        }
                    }
                }
            }

            if learned.is_empty() && *kind == DeviceKind::Router {
                continue;
            }

            let _guard = self.locks.lock(src).await;
            let ns = Netns::attach(src);
            for (net, hop) in &learned {
                let dest = format!("{net}/24");
                match ns.add_route(&dest, *hop).await {
                    Ok(()) => installed += 1,
                    Err(e) => warn!(device = src, dest, error = %e, "auto-route failed"),
                }
            }

            // Hosts additionally get a default gateway: the first router
            // on any directly-connected subnet.
            if *kind != DeviceKind::Router {
                let gateway = direct.iter().find_map(|net| {
                    members[net]
                        .iter()
                        .find(|(d, _, is_router)| *is_router && d != src)
                        .map(|(_, addr, _)| *addr)
                });
                if let Some(gw) = gateway {
                    match ns.set_default_gateway(gw).await {
                        Ok(()) => {
                            if let Some(dev) = self.devices.lock().unwrap().get_mut(src) {
                                dev.default_gateway = Some(gw);
                            }
                            installed += 1;
                        }
                        Err(e) => warn!(device = src, %gw, error = %e, "auto-gateway failed"),
                    }
                }
            }
        }

        info!(installed, "auto-routing applied");
        Ok(installed)
    }

    // -- teardown ----------------------------------------------------------

    /// Full teardown in dependency order: links, then per-device sessions,
    /// observers, and namespaces. Used on shutdown; total by design.
    pub async fn cleanup(self: &Arc<Self>) {
        info!("tearing down topology");

        let link_ids: Vec<String> = self.links.lock().unwrap().keys().cloned().collect();
        for id in link_ids {
            if let Err(e) = self.remove_link(&id).await {
                warn!(link = id, error = %e, "teardown: link removal failed");
            }
        }

        let names: Vec<String> = self.devices.lock().unwrap().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.remove_device(&name).await {
                warn!(device = name, error = %e, "teardown: device removal failed");
            }
        }

        // Safety net for anything orphaned mid-flight.
        self.ptys.close_all().await;
        self.observers.stop_all();

        info!("topology teardown complete");
    }

    // -- internals ---------------------------------------------------------

    /// Pick the next interface name for a device and consume any pending
    /// creation-time address (first interface only).
    fn prepare_endpoint(&self, device: &str) -> (String, Option<(Ipv4Addr, u8)>) {
        let mut devices = self.devices.lock().unwrap();
        let dev = devices.get_mut(device).expect("checked under lock");
        let name = dev.next_iface_name();
        let pending = if dev.interfaces.is_empty() {
            dev.pending_addr.take()
        } else {
            None
        };
        (name, pending)
    }

    fn commit_link(&self, link: &Link, ends: &[(&str, &str, Ipv4Addr, u8)]) {
        let baseline = link.shaping();
        let mut devices = self.devices.lock().unwrap();
        for (device, iface, addr, prefix) in ends {
            if let Some(dev) = devices.get_mut(*device) {
                dev.interfaces.push(Interface {
                    name: iface.to_string(),
                    addr: Some(*addr),
                    prefix: *prefix,
                    baseline,
                    link_id: Some(link.id.clone()),
                });
            }
        }
        drop(devices);
        self.links.lock().unwrap().insert(link.id.clone(), link.clone());
    }

    fn summarize_link(&self, id: &str) -> Option<LinkSummary> {
        self.links.lock().unwrap().get(id).map(link_summary)
    }

    fn hostname_records(&self) -> BTreeMap<String, Ipv4Addr> {
        let devices = self.devices.lock().unwrap();
        devices
            .values()
            .filter_map(|d| d.primary_addr().map(|a| (d.name.clone(), a)))
            .collect()
    }

    /// Point every namespace's resolver at the DNS device, if one exists.
    /// The kernel mounts `/etc/netns/<name>/resolv.conf` over
    /// `/etc/resolv.conf` for processes entered via `ip netns exec`.
    async fn refresh_resolv_conf(&self) {
        let (dns_addr, names): (Option<Ipv4Addr>, Vec<(String, DeviceKind)>) = {
            let devices = self.devices.lock().unwrap();
            let dns = devices
                .values()
                .find(|d| d.kind == DeviceKind::DnsServer)
                .and_then(|d| d.primary_addr());
            let names = devices
                .values()
                .map(|d| (d.name.clone(), d.kind))
                .collect();
            (dns, names)
        };

        for (name, kind) in names {
            if kind == DeviceKind::Switch {
                continue;
            }
            let dir = resolv_dir(&name);
            let path = format!("{dir}/resolv.conf");
            match dns_addr {
                Some(addr) => {
                    let content = if kind == DeviceKind::DnsServer {
                        "nameserver 127.0.0.1\nsearch lan\n".to_string()
                    } else {
                        format!("nameserver {addr}\nsearch lan\n")
                    };
                    if tokio::fs::create_dir_all(&dir).await.is_ok()
                        && let Err(e) = tokio::fs::write(&path, content).await
                    {
                        debug!(device = name, error = %e, "writing resolv.conf failed");
                    }
                }
                None => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
    }
}

fn resolv_dir(device: &str) -> String {
    format!("/etc/netns/{device}")
}

fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_DEVICE_NAME {
        return Err(EmuError::invalid(format!(
            "device name must be 1..={MAX_DEVICE_NAME} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EmuError::invalid(format!(
            "device name '{name}' (want [A-Za-z0-9_-]+)"
        )));
    }
    Ok(())
}

fn validate_failure(failure: &Failure) -> Result<()> {
    match failure {
        Failure::PacketLoss { pct, .. } if !(0.0..=100.0).contains(pct) => Err(EmuError::invalid(
            format!("packet loss {pct}% out of [0, 100]"),
        )),
        Failure::BandwidthLimit { mbps, .. } if *mbps <= 0.0 => {
            Err(EmuError::invalid(format!("bandwidth {mbps} must be > 0")))
        }
        _ => Ok(()),
    }
}

fn live_device<'a>(
    devices: &'a FxHashMap<String, Device>,
    name: &str,
) -> Result<&'a Device> {
    match devices.get(name) {
        Some(dev) if !dev.removing => Ok(dev),
        _ => Err(EmuError::not_found(format!("device '{name}'"))),
    }
}

fn summarize(device: &Device) -> DeviceSummary {
    DeviceSummary {
        name: device.name.clone(),
        kind: device.kind,
        x: device.position.0,
        y: device.position.1,
        interfaces: device
            .interfaces
            .iter()
            .map(|i| IfaceSummary {
                name: i.name.clone(),
                address: i.addr.map(|a| format!("{a}/{}", i.prefix)),
                link_id: i.link_id.clone(),
            })
            .collect(),
        default_gateway: device.default_gateway,
        failures: device.failures.clone(),
    }
}

fn link_summary(link: &Link) -> LinkSummary {
    LinkSummary {
        id: link.id.clone(),
        kind: link.kind,
        a: link.a.clone(),
        b: link.b.clone(),
        latency_ms: link.latency_ms,
        jitter_ms: link.jitter_ms,
        bandwidth_mbps: link.bandwidth_mbps,
        loss_pct: link.loss_pct,
        subnet: link
            .subnet
            .map(|n| format!("{}/24", SubnetAllocator::network(n))),
    }
}
