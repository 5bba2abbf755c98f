//! Memory registration cache.
//!
//! Registering memory with the device is expensive, so each pool chunk is
//! registered once and later buffers from the same chunk reuse its key.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info};

use crate::api::{DeviceControl, Mbuf, MemRegion, Mempool};
use crate::errors::RegistrationError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MrEntry {
    pub lkey: u32,
    pub region: MemRegion,
}

pub struct MrCache {
    device: Arc<dyn DeviceControl>,
    // keyed by region start
    entries: BTreeMap<usize, MrEntry>,
    misses: u64,
}

impl MrCache {
    pub fn new(device: Arc<dyn DeviceControl>) -> Self {
        Self {
            device,
            entries: BTreeMap::new(),
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of lookups that went to the device.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn lookup(&self, addr: usize) -> Option<&MrEntry> {
        self.entries
            .range(..=addr)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.region.contains(addr))
    }

    /// Local key for the memory backing `mbuf`, registering its region on
    /// first use. A rejected region is not cached.
    pub fn resolve(&mut self, pool: &dyn Mempool, mbuf: &Mbuf) -> Result<u32, RegistrationError> {
        if let Some(entry) = self.lookup(mbuf.addr()) {
            return Ok(entry.lkey);
        }

        self.misses += 1;
        let region = pool.region(mbuf);
        if !region.contains(mbuf.addr()) {
            error!(
                "pool region {:#x}+{} does not cover buffer {:#x}",
                region.addr,
                region.len,
                mbuf.addr()
            );
            return Err(RegistrationError {
                addr: region.addr,
                len: region.len,
                source: std::io::Error::from(nix::errno::Errno::EFAULT),
            });
        }

        let lkey = self
            .device
            .register_memory(region)
            .map_err(|source| RegistrationError {
                addr: region.addr,
                len: region.len,
                source,
            })?;
        info!(
            "registered mr {:#x}+{} lkey {:#x}",
            region.addr, region.len, lkey
        );
        self.entries.insert(region.addr, MrEntry { lkey, region });
        Ok(lkey)
    }
}
