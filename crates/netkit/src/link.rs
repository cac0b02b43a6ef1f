//! veth pairs, bridges, and link materialization.
//!
//! A link is always one veth pair. For point-to-point links each end moves
//! into an endpoint namespace; for switched links one end moves into the
//! switch's namespace and is enslaved to its bridge. Any failure mid-way
//! deletes the pair, which unwinds everything the kernel created for it.

use rand::Rng;
use tracing::debug;

use crate::cmd::{run_checked, run_ignored};
use crate::error::{NetError, Result};
use crate::namespace::Netns;

/// Host-visible scratch name for one end of a veth pair.
///
/// The pair only exists in the root namespace for a few milliseconds before
/// both ends are moved out, but names must not collide across concurrent
/// link creations.
pub fn scratch_veth_name() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..8)
        .map(|_| {
            let n: u8 = rng.random_range(0..16);
            char::from_digit(n as u32, 16).unwrap()
        })
        .collect();
    format!("veth-{suffix}")
}

/// Create a veth pair in the root namespace.
async fn create_pair(a: &str, b: &str) -> Result<()> {
    run_checked(
        "ip",
        &["link", "add", a, "type", "veth", "peer", "name", b],
    )
    .await?;
    debug!(a, b, "created veth pair");
    Ok(())
}

/// Move a root-namespace interface into `ns`.
async fn move_into(iface: &str, ns: &Netns) -> Result<()> {
    run_checked("ip", &["link", "set", iface, "netns", ns.name()]).await
        .map(|_| ())
}

/// Rename an interface inside its namespace and bring it up.
async fn finalize(ns: &Netns, scratch: &str, target: &str) -> Result<()> {
    ns.exec_checked("ip", &["link", "set", scratch, "name", target])
        .await?;
    ns.set_link_state(target, true).await
}

/// Materialize a point-to-point link: one veth pair, each end renamed and
/// brought up inside its endpoint namespace.
pub async fn create_p2p(
    ns_a: &Netns,
    iface_a: &str,
    ns_b: &Netns,
    iface_b: &str,
) -> Result<()> {
    validate_iface(iface_a)?;
    validate_iface(iface_b)?;

    let scratch_a = scratch_veth_name();
    let scratch_b = scratch_veth_name();

    create_pair(&scratch_a, &scratch_b).await?;

    let result: Result<()> = async {
        move_into(&scratch_a, ns_a).await?;
        move_into(&scratch_b, ns_b).await?;
        finalize(ns_a, &scratch_a, iface_a).await?;
        finalize(ns_b, &scratch_b, iface_b).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        // Deleting either end removes the pair; try all the places an end
        // might be stranded.
        run_ignored("ip", &["link", "del", &scratch_a]).await;
        ns_a.exec("ip", &["link", "del", &scratch_a]).await.ok();
        ns_a.exec("ip", &["link", "del", iface_a]).await.ok();
        return Err(e);
    }

    debug!(
        ns_a = ns_a.name(),
        iface_a,
        ns_b = ns_b.name(),
        iface_b,
        "p2p link up"
    );
    Ok(())
}

/// Materialize a switched link: the endpoint side lands in `endpoint_ns`,
/// the other end lands in the switch's namespace and is enslaved to its
/// bridge.
pub async fn create_switched(
    endpoint_ns: &Netns,
    endpoint_iface: &str,
    switch_ns: &Netns,
    switch_iface: &str,
    bridge: &str,
) -> Result<()> {
    validate_iface(endpoint_iface)?;
    validate_iface(switch_iface)?;

    let scratch_e = scratch_veth_name();
    let scratch_s = scratch_veth_name();

    create_pair(&scratch_e, &scratch_s).await?;

    let result: Result<()> = async {
        move_into(&scratch_e, endpoint_ns).await?;
        move_into(&scratch_s, switch_ns).await?;
        finalize(endpoint_ns, &scratch_e, endpoint_iface).await?;
        switch_ns
            .exec_checked("ip", &["link", "set", scratch_s.as_str(), "name", switch_iface])
            .await?;
        switch_ns
            .exec_checked("ip", &["link", "set", switch_iface, "master", bridge])
            .await?;
        switch_ns.set_link_state(switch_iface, true).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        run_ignored("ip", &["link", "del", &scratch_e]).await;
        endpoint_ns.exec("ip", &["link", "del", &scratch_e]).await.ok();
        endpoint_ns.exec("ip", &["link", "del", endpoint_iface]).await.ok();
        return Err(e);
    }

    debug!(
        endpoint = endpoint_ns.name(),
        endpoint_iface,
        switch = switch_ns.name(),
        bridge,
        "switched link up"
    );
    Ok(())
}

/// Delete one end of a veth pair; the kernel removes the peer with it.
/// Idempotent: a missing interface (or namespace) is success.
pub async fn delete_iface(ns: &Netns, iface: &str) -> Result<()> {
    match ns.exec_checked("ip", &["link", "del", iface]).await {
        Ok(_) | Err(NetError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create a bridge inside `ns` and bring it up.
pub async fn create_bridge(ns: &Netns, bridge: &str) -> Result<()> {
    validate_iface(bridge)?;
    ns.exec_checked("ip", &["link", "add", bridge, "type", "bridge"])
        .await?;
    ns.set_link_state(bridge, true).await?;
    debug!(ns = ns.name(), bridge, "bridge up");
    Ok(())
}

/// Delete a bridge. Idempotent.
pub async fn delete_bridge(ns: &Netns, bridge: &str) -> Result<()> {
    match ns.exec_checked("ip", &["link", "del", bridge]).await {
        Ok(_) | Err(NetError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Learned/static entries in a bridge's forwarding database.
pub async fn bridge_fdb(ns: &Netns, bridge: &str) -> Result<Vec<String>> {
    let output = ns
        .exec_checked("bridge", &["fdb", "show", "br", bridge])
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.is_empty() && !(l.contains("self") && l.contains("permanent")))
        .map(str::to_string)
        .collect())
}

fn validate_iface(name: &str) -> Result<()> {
    // Linux netdev name limit (IFNAMSIZ - 1)
    if name.is_empty() || name.len() > 15 {
        return Err(NetError::InvalidArgument(format!(
            "interface name '{name}' (1..=15 chars)"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(NetError::InvalidArgument(format!(
            "interface name '{name}' (want [A-Za-z0-9_-]+)"
        )));
    }
    Ok(())
}
