//! Bring-up and teardown of every rx queue of a port.
//!
//! Start builds, per queue, a completion queue and a work queue; then one
//! indirection table over all work queues and one hashing QP over the
//! table. Only after the QP binds the rings are their runtime addresses
//! valid, so they are queried last, right before the initial fill. Stop
//! tears the same objects down in reverse dependency order and reclaims
//! every buffer the device still held.

use std::sync::Arc;

use log::{error, info};

use crate::api::{DevObject, DeviceControl, Mempool, ObjectKind};
use crate::config::{RxFlags, check_data_room, max_rx_frame};
use crate::errors::{ConfigError, StartError};
use crate::rss::RssConf;
use crate::rxq::RxQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Uncreated,
    Starting,
    Running,
    Stopping,
}

pub struct RxPort {
    device: Arc<dyn DeviceControl>,
    queues: Vec<RxQueue>,
    ind_table: DevObject,
    hash_qp: DevObject,
    rss: RssConf,
    state: PortState,
}

impl RxPort {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        pool: Arc<dyn Mempool>,
        flags: &RxFlags,
    ) -> Result<Self, ConfigError> {
        flags.validate()?;
        check_data_room(pool.data_room_size(), pool.headroom())?;
        info!(
            "rx port: {} queues x {} descriptors, max frame {}",
            flags.num_queues,
            flags.ring_size,
            max_rx_frame(pool.usable_size())
        );

        let queues = (0..flags.num_queues)
            .map(|id| RxQueue::new(id, flags.ring_size, flags.socket, device.clone(), pool.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            device,
            queues,
            ind_table: DevObject::empty(ObjectKind::IndTable),
            hash_qp: DevObject::empty(ObjectKind::HashQp),
            rss: flags.rss.clone(),
            state: PortState::Uncreated,
        })
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == PortState::Running
    }

    pub fn queues(&self) -> &[RxQueue] {
        &self.queues
    }

    pub fn queue_mut(&mut self, id: usize) -> Option<&mut RxQueue> {
        self.queues.get_mut(id)
    }

    pub fn ind_table(&self) -> &DevObject {
        &self.ind_table
    }

    pub fn hash_qp(&self) -> &DevObject {
        &self.hash_qp
    }

    /// Brings every queue up and fills it. On failure everything created
    /// so far is torn down again before the error is returned.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state != PortState::Uncreated {
            return Err(StartError::AlreadyStarted);
        }

        info!("start rx queues");
        self.state = PortState::Starting;
        match self.start_inner() {
            Ok(()) => {
                self.state = PortState::Running;
                Ok(())
            }
            Err(e) => {
                error!("rx start failed, rolling back: {e}");
                self.stop();
                Err(e)
            }
        }
    }

    fn start_inner(&mut self) -> Result<(), StartError> {
        let hash_conf = self.rss.hash_conf()?;

        let mut ind_tbl = Vec::with_capacity(self.queues.len());
        for q in self.queues.iter_mut() {
            ind_tbl.push(q.create_objects()?);
        }

        let log_size = ind_tbl.len().next_power_of_two().trailing_zeros();
        let ind_table = self
            .device
            .create_ind_table(log_size, &ind_tbl)
            .map_err(|e| {
                error!("failed to create ind_table ret {e}");
                StartError::IndirectionTable(e)
            })?;
        self.ind_table = DevObject::new(ObjectKind::IndTable, ind_table, self.device.clone());
        info!("ind_table handle {} num {}", ind_table.0, ind_tbl.len());

        let qp = self
            .device
            .create_hash_qp(ind_table, &hash_conf)
            .map_err(|e| {
                error!("rx create hash qp failed {e}");
                StartError::HashQp(e)
            })?;
        self.hash_qp = DevObject::new(ObjectKind::HashQp, qp, self.device.clone());

        for q in self.queues.iter_mut() {
            q.query_objects()?;
        }

        for q in self.queues.iter_mut() {
            q.fill().map_err(|source| {
                error!("failed to post RX ret = {source}");
                StartError::Fill {
                    queue: q.id(),
                    source,
                }
            })?;
            q.ring_doorbell()?;
        }

        Ok(())
    }

    /// Tears every queue down and returns all posted buffers to the pool.
    ///
    /// Never fails: device errors are logged and the port still ends up
    /// empty. Calling it on a stopped or never started port is a no-op.
    pub fn stop(&mut self) {
        self.state = PortState::Stopping;

        // the QP references the table, the table references the work queues
        if let Err(e) = self.hash_qp.destroy() {
            error!("rx_queue destroy_qp failed {e}");
        }
        if let Err(e) = self.ind_table.destroy() {
            error!("destroy rwq ind table failed {e}");
        }

        for q in self.queues.iter_mut() {
            q.stop();
        }

        self.state = PortState::Uncreated;
    }
}

impl Drop for RxPort {
    fn drop(&mut self) {
        self.stop();
    }
}
