//! The device control layer: object creation, work submission, doorbells.

use std::io;

use super::buffer::MemRegion;
use crate::rss::RxHashConf;

/// Size of a work-queue basic unit, in bytes.
pub const GDMA_WQE_ALIGNMENT_UNIT_SIZE: u32 = 32;
/// Size of one completion-queue entry, in bytes.
pub const COMP_ENTRY_SIZE: u32 = 64;
pub const NOT_USING_CLIENT_DATA_UNIT: u32 = 0;

const WQE_HEADER_SIZE: u32 = 8;
const INLINE_OOB_SMALL_SIZE: u32 = 8;
const INLINE_OOB_LARGE_SIZE: u32 = 24;
const SGL_ELEMENT_SIZE: u32 = 16;

/// Opaque handle returned by the device for a created object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Completion queue.
    Cq,
    /// Receive work queue.
    Wq,
    /// Indirection table over receive work queues.
    IndTable,
    /// Hashing/distribution queue pair bound to an indirection table.
    HashQp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum QueueType {
    Send = 0,
    Receive = 1,
    Completion = 2,
}

#[derive(Clone, Copy, Debug)]
pub struct WqAttr {
    pub max_wr: u32,
    pub max_sge: u32,
    pub cq: RawHandle,
    pub socket: i32,
}

/// Device page doorbell writes go through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DoorbellPage(pub usize);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CqInfo {
    pub buffer: usize,
    pub count: u32,
    pub id: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RqInfo {
    pub buffer: usize,
    pub count: u32,
    pub size: u32,
    pub id: u32,
}

/// Runtime addresses of a queue's objects, valid once a hash QP binds them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxObjects {
    pub cq: CqInfo,
    pub rq: RqInfo,
    pub db_page: DoorbellPage,
}

/// Software view of a hardware submission ring. `head` and `tail` count
/// basic units and run freely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkQueue {
    pub id: u32,
    pub buffer: usize,
    pub count: u32,
    pub size: u32,
    pub head: u32,
    pub tail: u32,
}

impl WorkQueue {
    pub fn used_bytes(&self) -> u32 {
        self.head.wrapping_sub(self.tail) * GDMA_WQE_ALIGNMENT_UNIT_SIZE
    }

    pub fn free_bytes(&self) -> u32 {
        self.size.saturating_sub(self.used_bytes())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompletionQueue {
    pub id: u32,
    pub buffer: usize,
    pub count: u32,
    pub size: u32,
    pub head: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SglElement {
    /// Little-endian bus address.
    pub address: u64,
    pub memory_key: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct WorkRequest<'a> {
    pub sgl: &'a [SglElement],
    pub inline_oob: &'a [u8],
    pub flags: u32,
    pub client_data_unit: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostedWqeInfo {
    pub wqe_index: u32,
    pub wqe_size_in_bu: u32,
}

/// Number of basic units a work request occupies on the ring.
pub fn wqe_size_in_bu(num_sge: usize, inline_oob_len: usize) -> u32 {
    let oob = if inline_oob_len as u32 > INLINE_OOB_SMALL_SIZE {
        INLINE_OOB_LARGE_SIZE
    } else {
        INLINE_OOB_SMALL_SIZE
    };
    let bytes = WQE_HEADER_SIZE + oob + SGL_ELEMENT_SIZE * num_sge.max(1) as u32;
    bytes.div_ceil(GDMA_WQE_ALIGNMENT_UNIT_SIZE)
}

/// Synchronous access to the NIC's control and data-path objects.
///
/// `destroy` must not return until the device has stopped touching memory
/// referenced by the destroyed object; rx buffers are reclaimed right after.
pub trait DeviceControl: Send + Sync {
    fn create_cq(&self, entries: u32, socket: i32) -> io::Result<RawHandle>;

    fn create_wq(&self, attr: &WqAttr) -> io::Result<RawHandle>;

    /// `wqs.len()` must not exceed `1 << log_size`.
    fn create_ind_table(&self, log_size: u32, wqs: &[RawHandle]) -> io::Result<RawHandle>;

    fn create_hash_qp(&self, ind_table: RawHandle, conf: &RxHashConf) -> io::Result<RawHandle>;

    fn destroy(&self, kind: ObjectKind, handle: RawHandle) -> io::Result<()>;

    fn query_rx_objects(&self, cq: RawHandle, wq: RawHandle) -> io::Result<RxObjects>;

    /// Registers `region` for DMA and returns its local key.
    fn register_memory(&self, region: MemRegion) -> io::Result<u32>;

    /// Writes `req` at `wq.head` and advances `wq.head` by its size.
    fn post_work_request(
        &self,
        wq: &mut WorkQueue,
        req: &WorkRequest<'_>,
    ) -> io::Result<PostedWqeInfo>;

    fn ring_doorbell(
        &self,
        page: DoorbellPage,
        queue_type: QueueType,
        queue_id: u32,
        tail: u32,
    ) -> io::Result<()>;
}
