//! Subnet and address bookkeeping.
//!
//! Links draw `/24` subnets from `10.0.<n>.0/24` starting at n = 1.
//! Released subnets go on a free list and are reused smallest-first, so
//! creating and removing a link rewinds the pool to its prior state. Every
//! assigned address also passes through a process-wide registry that
//! enforces instance-wide uniqueness.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;

use crate::error::{EmuError, Result};

/// Allocator over the `10.0.<n>.0/24` space.
#[derive(Debug)]
pub struct SubnetAllocator {
    next: u16,
    free: BTreeSet<u8>,
    /// Next host octet per live subnet (starts at 1).
    hosts: FxHashMap<u8, u8>,
}

impl Default for SubnetAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SubnetAllocator {
    pub fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
            hosts: FxHashMap::default(),
        }
    }

    /// Claim the next free subnet index.
    pub fn allocate(&mut self) -> Result<u8> {
        let n = if let Some(&n) = self.free.iter().next() {
            self.free.remove(&n);
            n
        } else {
            if self.next > 255 {
                return Err(EmuError::exhausted(
                    "subnet pool exhausted (10.0.1.0/24 .. 10.0.255.0/24)",
                ));
            }
            let n = self.next as u8;
            self.next += 1;
            n
        };
        self.hosts.insert(n, 1);
        Ok(n)
    }

    /// Return a subnet to the pool.
    pub fn release(&mut self, subnet: u8) {
        self.hosts.remove(&subnet);
        if subnet as u16 + 1 == self.next {
            // Rewind the high-water mark over any trailing free run.
            self.next = subnet as u16;
            while self.next > 1 && self.free.remove(&((self.next - 1) as u8)) {
                self.next -= 1;
            }
        } else if (subnet as u16) < self.next {
            self.free.insert(subnet);
        }
    }

    /// Next host address inside a live subnet (`10.0.<subnet>.<host>`).
    pub fn allocate_host(&mut self, subnet: u8) -> Result<Ipv4Addr> {
        let host = self
            .hosts
            .get_mut(&subnet)
            .ok_or_else(|| EmuError::internal(format!("subnet {subnet} not allocated")))?;
        if *host >= 255 {
            return Err(EmuError::exhausted(format!(
                "no free host addresses in 10.0.{subnet}.0/24"
            )));
        }
        let addr = Ipv4Addr::new(10, 0, subnet, *host);
        *host += 1;
        Ok(addr)
    }

    pub fn network(subnet: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, subnet, 0)
    }
}

/// Instance-wide address ownership: address → (device, interface).
#[derive(Debug, Default)]
pub struct AddressRegistry {
    owners: FxHashMap<Ipv4Addr, (String, String)>,
}

impl AddressRegistry {
    /// Claim an address for `(device, iface)`. The identical claim is
    /// idempotent; any other owner is a conflict.
    pub fn claim(&mut self, addr: Ipv4Addr, device: &str, iface: &str) -> Result<()> {
        match self.owners.get(&addr) {
            None => {
                self.owners
                    .insert(addr, (device.to_string(), iface.to_string()));
                Ok(())
            }
            Some((d, i)) if d == device && i == iface => Ok(()),
            Some((d, i)) => Err(EmuError::address_conflict(format!(
                "{addr} already assigned to {d}:{i}"
            ))),
        }
    }

    pub fn release(&mut self, addr: Ipv4Addr) {
        self.owners.remove(&addr);
    }

    /// Drop every address owned by a device.
    pub fn release_device(&mut self, device: &str) {
        self.owners.retain(|_, (d, _)| d != device);
    }

    pub fn owner(&self, addr: Ipv4Addr) -> Option<&(String, String)> {
        self.owners.get(&addr)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
