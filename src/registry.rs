//! Adapters known to this process.
//!
//! The registry is an ordinary value owned by whoever enumerates devices;
//! nothing here is global.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::api::DeviceControl;
use crate::errors::RegistryError;

pub const MAX_VPORTS: u16 = 8;

pub struct Adapter {
    name: String,
    device: Arc<dyn DeviceControl>,
    max_vport_nb: u16,
    // bit i set: vport i in use
    cur_vports: u8,
}

impl Adapter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> Arc<dyn DeviceControl> {
        self.device.clone()
    }

    pub fn max_vports(&self) -> u16 {
        self.max_vport_nb
    }

    pub fn vport_count(&self) -> u16 {
        self.cur_vports.count_ones() as u16
    }

    pub fn vport_in_use(&self, idx: u16) -> bool {
        idx < self.max_vport_nb && self.cur_vports & (1 << idx) != 0
    }

    /// Claims the lowest free vport index.
    pub fn alloc_vport(&mut self) -> Option<u16> {
        let idx = (0..self.max_vport_nb).find(|&i| self.cur_vports & (1 << i) == 0)?;
        self.cur_vports |= 1 << idx;
        debug!("{}: vport {idx} allocated", self.name);
        Some(idx)
    }

    /// Returns false if `idx` was not allocated.
    pub fn release_vport(&mut self, idx: u16) -> bool {
        if !self.vport_in_use(idx) {
            warn!("{}: release of unused vport {idx}", self.name);
            return false;
        }
        self.cur_vports &= !(1 << idx);
        debug!("{}: vport {idx} released", self.name);
        true
    }
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<Adapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn register(
        &mut self,
        name: &str,
        device: Arc<dyn DeviceControl>,
        max_vport_nb: u16,
    ) -> Result<&mut Adapter, RegistryError> {
        if max_vport_nb == 0 || max_vport_nb > MAX_VPORTS {
            return Err(RegistryError::VportCount(max_vport_nb));
        }
        if self.find(name).is_some() {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        info!("adapter {name} registered, {max_vport_nb} vports");
        self.adapters.push(Adapter {
            name: name.to_owned(),
            device,
            max_vport_nb,
            cur_vports: 0,
        });
        let last = self.adapters.len() - 1;
        Ok(&mut self.adapters[last])
    }

    pub fn find(&self, name: &str) -> Option<&Adapter> {
        self.adapters.iter().find(|a| a.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Adapter> {
        self.adapters.iter_mut().find(|a| a.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Result<Adapter, RegistryError> {
        let pos = self
            .adapters
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
        let adapter = self.adapters.remove(pos);
        if adapter.vport_count() > 0 {
            warn!(
                "adapter {name} removed with {} vports in use",
                adapter.vport_count()
            );
        }
        Ok(adapter)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Adapter> {
        self.adapters.iter()
    }
}
