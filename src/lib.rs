//! Netlab Emulator Library
//!
//! Server-side core of a kernel-level network emulator: topology
//! orchestration over Linux network namespaces and veth links, interactive
//! PTY sessions bound to namespaces, passive packet observation, and the
//! control/streaming server that exposes it all.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod error;
pub mod events;
pub mod exec;
pub mod observer;
pub mod pty;
pub mod server;
pub mod topology;

#[cfg(test)]
pub mod tests;

// Re-export commonly used items
pub use error::{EmuError, ErrorKind};
pub use observer::{PacketEvent, PacketKind, Protocol};
pub use topology::{DeviceKind, Failure, Topology};
