//! Network namespace lifecycle and intra-namespace state.
//!
//! A [`Netns`] is a thin handle over a kernel namespace: creation brings up
//! loopback, deletion lets the kernel reap any interfaces (including veth
//! peers) still inside. No network state is cached here — every read goes
//! back to the kernel.

use std::net::Ipv4Addr;
use std::process::Output;

use tracing::debug;

use crate::cmd::{run, run_checked, run_ignored, run_lines};
use crate::error::{NetError, Result};

/// Handle to a named kernel network namespace.
///
/// Deliberately not RAII: the topology layer owns teardown ordering
/// (links before sessions before observers before the namespace itself),
/// so deletion is an explicit, idempotent call.
#[derive(Debug, Clone)]
pub struct Netns {
    name: String,
}

/// One interface as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceState {
    pub name: String,
    pub mac: Option<String>,
    /// CIDR-form IPv4 addresses, e.g. `10.0.1.1/24`.
    pub addresses: Vec<String>,
    pub up: bool,
}

/// Read-through view of a namespace.
#[derive(Debug, Clone, Default)]
pub struct NetnsView {
    pub interfaces: Vec<IfaceState>,
    pub routes: Vec<String>,
    pub arp: Vec<String>,
    pub forwarding: bool,
}

impl Netns {
    /// Create the namespace and bring up loopback.
    pub async fn create(name: &str) -> Result<Self> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(NetError::InvalidArgument(format!(
                "namespace name '{name}' (want [A-Za-z0-9_-]+)"
            )));
        }

        run_checked("ip", &["netns", "add", name]).await.map_err(|e| match e {
            NetError::AlreadyExists(_) => NetError::AlreadyExists(format!("namespace '{name}'")),
            other => other,
        })?;
        debug!(ns = name, "created network namespace");

        let ns = Self {
            name: name.to_string(),
        };
        ns.exec_checked("ip", &["link", "set", "lo", "up"]).await?;
        Ok(ns)
    }

    /// Handle to a namespace assumed to exist already.
    pub fn attach(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Delete a namespace. Idempotent: a missing namespace is success.
    pub async fn delete(name: &str) -> Result<()> {
        match run_checked("ip", &["netns", "del", name]).await {
            Ok(_) => {
                debug!(ns = name, "deleted network namespace");
                Ok(())
            }
            Err(NetError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Namespaces currently known to the kernel.
    pub async fn list() -> Result<Vec<String>> {
        let lines = run_lines("ip", &["netns", "list"]).await?;
        Ok(lines
            .iter()
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a command inside this namespace, returning raw output.
    pub async fn exec(&self, program: &str, args: &[&str]) -> Result<Output> {
        let full = self.exec_argv(program, args);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        run("ip", &refs).await
    }

    /// Run a command inside this namespace, failing on non-zero exit.
    pub async fn exec_checked(&self, program: &str, args: &[&str]) -> Result<Output> {
        let full = self.exec_argv(program, args);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        run_checked("ip", &refs).await
    }

    async fn exec_lines(&self, program: &str, args: &[&str]) -> Result<Vec<String>> {
        let output = self.exec_checked(program, args).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// The `ip netns exec` argv prefix for running `program args...` inside
    /// this namespace (without the leading `ip` itself).
    pub fn exec_argv(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut full = vec![
            "netns".to_string(),
            "exec".to_string(),
            self.name.clone(),
            program.to_string(),
        ];
        full.extend(args.iter().map(|s| s.to_string()));
        full
    }

    /// Toggle IPv4 forwarding.
    pub async fn set_forwarding(&self, enabled: bool) -> Result<()> {
        let val = if enabled { "net.ipv4.ip_forward=1" } else { "net.ipv4.ip_forward=0" };
        self.exec_checked("sysctl", &["-w", val]).await?;
        debug!(ns = self.name, enabled, "ipv4 forwarding");
        Ok(())
    }

    pub async fn forwarding(&self) -> Result<bool> {
        let lines = self.exec_lines("sysctl", &["-n", "net.ipv4.ip_forward"]).await?;
        Ok(lines.first().map(String::as_str) == Some("1"))
    }

    /// Assign an IPv4 address. Re-assigning the identical address is a no-op.
    pub async fn assign_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        if prefix == 0 || prefix > 32 {
            return Err(NetError::InvalidArgument(format!("prefix /{prefix}")));
        }
        let cidr = format!("{addr}/{prefix}");
        match self.exec_checked("ip", &["addr", "add", &cidr, "dev", iface]).await {
            Ok(_) | Err(NetError::AlreadyExists(_)) => {
                debug!(ns = self.name, iface, %cidr, "address assigned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove_address(&self, iface: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        let cidr = format!("{addr}/{prefix}");
        match self.exec_checked("ip", &["addr", "del", &cidr, "dev", iface]).await {
            Ok(_) | Err(NetError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Set interface admin state.
    pub async fn set_link_state(&self, iface: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        self.exec_checked("ip", &["link", "set", iface, state]).await?;
        debug!(ns = self.name, iface, state, "link state");
        Ok(())
    }

    /// Install or replace the default route.
    pub async fn set_default_gateway(&self, gw: Ipv4Addr) -> Result<()> {
        let gw = gw.to_string();
        self.exec_checked("ip", &["route", "replace", "default", "via", &gw]).await?;
        debug!(ns = self.name, %gw, "default gateway");
        Ok(())
    }

    /// Drop the default route. Idempotent.
    pub async fn remove_default_gateway(&self) -> Result<()> {
        match self.exec_checked("ip", &["route", "del", "default"]).await {
            Ok(_) | Err(NetError::NotFound(_)) => Ok(()),
            // `ip route del` reports a missing route as ESRCH ("No such process")
            Err(e) => Err(e),
        }
    }

    /// Install or replace a static route to `dest` (CIDR) via `gw`.
    pub async fn add_route(&self, dest: &str, gw: Ipv4Addr) -> Result<()> {
        let gw = gw.to_string();
        self.exec_checked("ip", &["route", "replace", dest, "via", &gw]).await?;
        Ok(())
    }

    /// Current interfaces with addresses, MAC, and admin state.
    pub async fn interfaces(&self) -> Result<Vec<IfaceState>> {
        let link_lines = self.exec_lines("ip", &["-o", "link", "show"]).await?;
        let addr_lines = self.exec_lines("ip", &["-o", "-4", "addr", "show"]).await?;
        Ok(parse_interfaces(&link_lines, &addr_lines))
    }

    /// Raw routing table lines.
    pub async fn routes(&self) -> Result<Vec<String>> {
        self.exec_lines("ip", &["route", "show"]).await
    }

    /// Raw ARP/neighbor cache lines.
    pub async fn arp_cache(&self) -> Result<Vec<String>> {
        self.exec_lines("ip", &["neigh", "show"]).await
    }

    /// Listening TCP/UDP sockets (`ss -tuln`, header stripped).
    pub async fn sockets(&self) -> Result<Vec<String>> {
        let mut lines = self.exec_lines("ss", &["-tuln"]).await?;
        if !lines.is_empty() {
            lines.remove(0);
        }
        Ok(lines)
    }

    /// Full read-through view used by device inspection.
    pub async fn view(&self) -> Result<NetnsView> {
        Ok(NetnsView {
            interfaces: self.interfaces().await?,
            routes: self.routes().await?,
            arp: self.arp_cache().await.unwrap_or_default(),
            forwarding: self.forwarding().await.unwrap_or(false),
        })
    }

    // -- egress packet filters ------------------------------------------------

    /// Drop all egress ICMP.
    pub async fn block_icmp(&self) -> Result<()> {
        self.iptables_add(&["-p", "icmp", "-j", "DROP"]).await
    }

    pub async fn unblock_icmp(&self) -> Result<()> {
        self.iptables_del(&["-p", "icmp", "-j", "DROP"]).await
    }

    /// Suppress the ICMP messages a router would emit about transiting
    /// traffic (TTL expiry and administrative rejection) without touching
    /// forwarding itself.
    pub async fn silence_router(&self) -> Result<()> {
        self.iptables_add(&["-p", "icmp", "--icmp-type", "time-exceeded", "-j", "DROP"])
            .await?;
        self.iptables_add(&[
            "-p",
            "icmp",
            "--icmp-type",
            "communication-prohibited",
            "-j",
            "DROP",
        ])
        .await
    }

    pub async fn unsilence_router(&self) -> Result<()> {
        self.iptables_del(&["-p", "icmp", "--icmp-type", "time-exceeded", "-j", "DROP"])
            .await?;
        self.iptables_del(&[
            "-p",
            "icmp",
            "--icmp-type",
            "communication-prohibited",
            "-j",
            "DROP",
        ])
        .await
    }

    /// Append an OUTPUT-chain rule unless an identical one is present.
    async fn iptables_add(&self, rule: &[&str]) -> Result<()> {
        let mut check = vec!["-w", "-C", "OUTPUT"];
        check.extend_from_slice(rule);
        if self.exec("iptables", &check).await?.status.success() {
            return Ok(());
        }
        let mut add = vec!["-w", "-A", "OUTPUT"];
        add.extend_from_slice(rule);
        self.exec_checked("iptables", &add).await?;
        Ok(())
    }

    /// Remove an OUTPUT-chain rule. Idempotent: absence is success.
    async fn iptables_del(&self, rule: &[&str]) -> Result<()> {
        let mut del = vec!["-w", "-D", "OUTPUT"];
        del.extend_from_slice(rule);
        match self.exec_checked("iptables", &del).await {
            Ok(_) | Err(NetError::NotFound(_)) => Ok(()),
            Err(NetError::Kernel(msg)) if msg.contains("does a matching rule exist") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Best-effort cleanup of a namespace by name, for rollback paths.
pub async fn delete_quietly(name: &str) {
    run_ignored("ip", &["netns", "del", name]).await;
}

/// Parse `ip -o link show` + `ip -o -4 addr show` output into interface
/// descriptors. Loopback is included; callers filter if they need to.
fn parse_interfaces(link_lines: &[String], addr_lines: &[String]) -> Vec<IfaceState> {
    let mut out: Vec<IfaceState> = Vec::new();

    for line in link_lines {
        // "2: eth0@if5: <BROADCAST,...,UP,LOWER_UP> mtu 1500 ... link/ether aa:bb:... brd ..."
        let mut parts = line.split_whitespace();
        let Some(_idx) = parts.next() else { continue };
        let Some(raw_name) = parts.next() else { continue };
        let name = raw_name
            .trim_end_matches(':')
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            continue;
        }

        let up = line
            .split('<')
            .nth(1)
            .and_then(|s| s.split('>').next())
            .is_some_and(|flags| flags.split(',').any(|f| f == "UP"));

        let mac = line
            .split_whitespace()
            .skip_while(|t| *t != "link/ether")
            .nth(1)
            .map(str::to_string);

        out.push(IfaceState {
            name,
            mac,
            addresses: Vec::new(),
            up,
        });
    }

    for line in addr_lines {
        // "2: eth0    inet 10.0.1.1/24 brd 10.0.1.255 scope global eth0"
        let mut parts = line.split_whitespace();
        let Some(_idx) = parts.next() else { continue };
        let Some(name) = parts.next() else { continue };
        let cidr = line
            .split_whitespace()
            .skip_while(|t| *t != "inet")
            .nth(1)
            .map(str::to_string);
        if let Some(cidr) = cidr
            && let Some(iface) = out.iter_mut().find(|i| i.name == name)
        {
            iface.addresses.push(cidr);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_and_addr_output() {
        let links = vec![
            "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT \
             group default qlen 1000\\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00"
                .to_string(),
            "2: eth0@if7: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode \
             DEFAULT group default qlen 1000\\    link/ether 3e:9a:11:22:33:44 brd \
             ff:ff:ff:ff:ff:ff"
                .to_string(),
        ];
        let addrs = vec![
            "1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever".to_string(),
            "2: eth0    inet 10.0.1.1/24 brd 10.0.1.255 scope global eth0\\       valid_lft \
             forever"
                .to_string(),
        ];

        let ifaces = parse_interfaces(&links, &addrs);
        assert_eq!(ifaces.len(), 2);

        let eth0 = ifaces.iter().find(|i| i.name == "eth0").unwrap();
        assert!(eth0.up);
        assert_eq!(eth0.mac.as_deref(), Some("3e:9a:11:22:33:44"));
        assert_eq!(eth0.addresses, vec!["10.0.1.1/24".to_string()]);
    }

    #[test]
    fn down_interface_has_no_up_flag() {
        let links = vec![
            "3: eth1: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DEFAULT group \
             default qlen 1000\\    link/ether aa:bb:cc:dd:ee:ff brd ff:ff:ff:ff:ff:ff"
                .to_string(),
        ];
        let ifaces = parse_interfaces(&links, &[]);
        assert_eq!(ifaces.len(), 1);
        assert!(!ifaces[0].up);
        assert!(ifaces[0].addresses.is_empty());
    }

    #[test]
    fn rejects_bad_namespace_names() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        for bad in ["", "has space", "slash/y", "dot.dot"] {
            let err = rt.block_on(Netns::create(bad)).unwrap_err();
            assert!(matches!(err, NetError::InvalidArgument(_)), "{bad}");
        }
    }
}
