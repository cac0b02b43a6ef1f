//! Traffic shaping via `tc` qdiscs.
//!
//! Latency, jitter, and loss map to a netem qdisc; bandwidth maps to a TBF
//! qdisc. When both are requested, TBF is the root (real enforcement, it
//! drops excess) and netem chains as its child. Applying always starts from
//! a clean slate — the existing root qdisc is deleted first — so repeated
//! application replaces rather than stacks.

use crate::error::{NetError, Result};
use crate::namespace::Netns;

/// Shaping parameters for one interface's egress.
///
/// All fields default to `None`; an all-`None` config clears any existing
/// qdisc and installs nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShapingSpec {
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub loss_pct: Option<f32>,
    pub bandwidth_mbps: Option<f64>,
}

impl ShapingSpec {
    pub fn is_empty(&self) -> bool {
        self.effective_latency().is_none()
            && self.effective_loss().is_none()
            && self.bandwidth_mbps.is_none()
    }

    /// Latency of zero means "no delay qdisc", not "a 0ms delay qdisc".
    fn effective_latency(&self) -> Option<u32> {
        self.latency_ms.filter(|ms| *ms > 0)
    }

    /// Loss of zero is a no-op.
    fn effective_loss(&self) -> Option<f32> {
        self.loss_pct.filter(|pct| *pct > 0.0)
    }

    fn has_netem_params(&self) -> bool {
        self.effective_latency().is_some() || self.effective_loss().is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(pct) = self.loss_pct
            && !(0.0..=100.0).contains(&pct)
        {
            return Err(NetError::InvalidArgument(format!(
                "loss_pct {pct} out of [0, 100]"
            )));
        }
        if let Some(mbps) = self.bandwidth_mbps
            && mbps <= 0.0
        {
            return Err(NetError::InvalidArgument(format!(
                "bandwidth_mbps {mbps} must be > 0"
            )));
        }
        Ok(())
    }

    /// Build the netem parameter list.
    fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(delay) = self.effective_latency() {
            args.push("delay".into());
            args.push(format!("{delay}ms"));
            if let Some(jitter) = self.jitter_ms
                && jitter > 0
            {
                args.push(format!("{jitter}ms"));
            }
        }

        if let Some(loss) = self.effective_loss() {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }

        args
    }
}

/// Apply `spec` to the egress of `iface` inside `ns`, replacing whatever
/// qdisc tree was installed before.
pub async fn apply(ns: &Netns, iface: &str, spec: ShapingSpec) -> Result<()> {
    spec.validate()?;

    // Clean slate; a missing root qdisc is fine.
    let _ = ns
        .exec("tc", &["qdisc", "del", "dev", iface, "root"])
        .await;

    if spec.is_empty() {
        return Ok(());
    }

    if let Some(mbps) = spec.bandwidth_mbps {
        let rate = format!("{mbps}mbit");
        tc_checked(
            ns,
            &[
                "qdisc", "add", "dev", iface, "root", "handle", "1:", "tbf", "rate", &rate,
                "burst", "32kbit", "latency", "400ms",
            ],
        )
        .await?;

        if spec.has_netem_params() {
            let netem = spec.netem_args();
            let mut args = vec![
                "qdisc", "add", "dev", iface, "parent", "1:1", "handle", "10:", "netem",
            ];
            let netem_refs: Vec<&str> = netem.iter().map(String::as_str).collect();
            args.extend_from_slice(&netem_refs);
            tc_checked(ns, &args).await?;
        }
    } else {
        let netem = spec.netem_args();
        let mut args = vec!["qdisc", "add", "dev", iface, "root", "netem"];
        let netem_refs: Vec<&str> = netem.iter().map(String::as_str).collect();
        args.extend_from_slice(&netem_refs);
        tc_checked(ns, &args).await?;
    }

    Ok(())
}

/// Remove any qdisc tree from `iface`. Idempotent.
pub async fn clear(ns: &Netns, iface: &str) -> Result<()> {
    let _ = ns
        .exec("tc", &["qdisc", "del", "dev", iface, "root"])
        .await;
    Ok(())
}

/// Current qdisc lines for an interface, for inspection and tests.
pub async fn show(ns: &Netns, iface: &str) -> Result<Vec<String>> {
    let output = ns
        .exec_checked("tc", &["qdisc", "show", "dev", iface])
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

async fn tc_checked(ns: &Netns, args: &[&str]) -> Result<()> {
    ns.exec_checked("tc", args).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_spec_is_empty() {
        assert!(ShapingSpec::default().is_empty());
    }

    #[test]
    fn zero_values_are_no_ops() {
        let spec = ShapingSpec {
            latency_ms: Some(0),
            loss_pct: Some(0.0),
            ..Default::default()
        };
        assert!(spec.is_empty());
        assert!(spec.netem_args().is_empty());
    }

    #[test]
    fn netem_args_delay_only() {
        let spec = ShapingSpec {
            latency_ms: Some(10),
            ..Default::default()
        };
        assert_eq!(spec.netem_args(), vec!["delay", "10ms"]);
    }

    #[test]
    fn netem_args_delay_with_jitter_and_loss() {
        let spec = ShapingSpec {
            latency_ms: Some(25),
            jitter_ms: Some(5),
            loss_pct: Some(12.5),
            ..Default::default()
        };
        assert_eq!(spec.netem_args(), vec!["delay", "25ms", "5ms", "loss", "12.5%"]);
    }

    #[test]
    fn jitter_without_delay_is_ignored() {
        let spec = ShapingSpec {
            jitter_ms: Some(5),
            ..Default::default()
        };
        assert!(spec.netem_args().is_empty());
    }

    #[test]
    fn validation_bounds() {
        let bad_loss = ShapingSpec {
            loss_pct: Some(101.0),
            ..Default::default()
        };
        assert!(bad_loss.validate().is_err());

        let bad_rate = ShapingSpec {
            bandwidth_mbps: Some(0.0),
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());

        let full_loss = ShapingSpec {
            loss_pct: Some(100.0),
            ..Default::default()
        };
        assert!(full_loss.validate().is_ok());
    }
}
