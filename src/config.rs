//! Rx port configuration.

use crate::errors::ConfigError;
use crate::rss::RssConf;

pub const DEFAULT_RXQ_NUM: u16 = 16;
pub const MAX_RX_QUEUES: usize = 64;
pub const DEFAULT_RING_SIZE: u32 = 1024;
pub const MAX_RING_SIZE: u32 = 32768;

/// Bytes reserved at the start of every packet buffer.
pub const MBUF_HEADROOM: u32 = 128;
pub const MIN_BUF_SIZE: u32 = 1024;
pub const MAX_FRAME_SIZE: u32 = 9728;

#[derive(Clone, Debug)]
pub struct RxFlags {
    pub num_queues: u16,
    /// Descriptors per queue.
    pub ring_size: u32,
    /// NUMA socket hardware rings are allocated on.
    pub socket: i32,
    pub rss: RssConf,
}

impl Default for RxFlags {
    fn default() -> Self {
        Self {
            num_queues: DEFAULT_RXQ_NUM,
            ring_size: DEFAULT_RING_SIZE,
            socket: 0,
            rss: RssConf::default(),
        }
    }
}

impl RxFlags {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nq = self.num_queues as usize;
        if nq == 0 || nq > MAX_RX_QUEUES {
            return Err(ConfigError::QueueCount(nq));
        }
        check_ring_size(self.ring_size)?;
        self.rss.validate()
    }
}

pub fn check_ring_size(ring_size: u32) -> Result<(), ConfigError> {
    if !ring_size.is_power_of_two() || ring_size > MAX_RING_SIZE {
        return Err(ConfigError::RingSize(ring_size));
    }
    Ok(())
}

/// The usable part of a buffer must hold at least [`MIN_BUF_SIZE`] bytes.
pub fn check_data_room(data_room: u32, headroom: u32) -> Result<(), ConfigError> {
    let usable = data_room.saturating_sub(headroom);
    if usable < MIN_BUF_SIZE {
        return Err(ConfigError::BufferTooSmall(usable));
    }
    Ok(())
}

/// Largest frame a buffer of `usable` bytes can receive in one segment.
pub fn max_rx_frame(usable: u32) -> u32 {
    usable.min(MAX_FRAME_SIZE)
}
