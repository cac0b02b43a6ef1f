//! Kernel plumbing for the netlab emulator.
//!
//! Everything here drives the Linux kernel through the `ip`/`tc`/`iptables`
//! tool family as child processes; no network behavior is modeled in user
//! space. The crate deliberately holds no topology state — the orchestrator
//! above owns records and teardown ordering, this layer owns the syscalls.
//!
//! # Modules
//!
//! - [`namespace`]: netns lifecycle, addresses, routes, filters, inspection
//! - [`link`]: veth pairs, bridges, p2p/switched link materialization
//! - [`shaping`]: netem/tbf qdisc configuration
//! - [`probe`]: privilege and tool probing, unique name generation
//! - [`cmd`]: checked child-process execution with error classification

pub mod cmd;
pub mod error;
pub mod link;
pub mod namespace;
pub mod probe;
pub mod shaping;

pub use error::{NetError, Result};
pub use namespace::{IfaceState, Netns, NetnsView};
pub use probe::{HostDefect, check_privileges, unique_name, verify_host, verify_netem};
pub use shaping::ShapingSpec;
