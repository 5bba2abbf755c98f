//! Packet buffers and the pool that hands them out.

use std::ptr::NonNull;

/// Opaque pool-local identifier of a buffer (slot index, offset, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc(pub(crate) usize);

impl From<usize> for BufferDesc {
    fn from(val: usize) -> Self {
        Self(val)
    }
}

impl From<BufferDesc> for usize {
    fn from(val: BufferDesc) -> usize {
        val.0
    }
}

/// A packet buffer owned by whoever holds it.
///
/// `Mbuf` has no drop glue: it must travel back to its pool through
/// [`Mempool::free`]. Dropping one on the floor leaks a pool slot.
#[must_use = "a buffer must be posted or returned to its pool"]
#[derive(Debug)]
pub struct Mbuf {
    desc: BufferDesc,
    data: NonNull<u8>,
}

// The data pointer refers to pool memory, which outlives every buffer
// carved out of it.
unsafe impl Send for Mbuf {}

impl Mbuf {
    pub fn new(desc: BufferDesc, data: NonNull<u8>) -> Self {
        Self { desc, data }
    }

    pub fn desc(&self) -> BufferDesc {
        self.desc
    }

    /// Start of the writable data area (past the headroom).
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

/// A contiguous chunk of pool memory, the unit of device registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemRegion {
    pub addr: usize,
    pub len: usize,
}

impl MemRegion {
    pub fn end(&self) -> usize {
        self.addr + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

/// Fixed-size packet buffer supplier.
///
/// Shared by every queue of a port, so implementations must tolerate
/// concurrent `alloc`/`free` from different queue contexts.
pub trait Mempool: Send + Sync {
    fn alloc(&self) -> Option<Mbuf>;

    fn free(&self, mbuf: Mbuf);

    /// Size of each buffer including headroom.
    fn data_room_size(&self) -> u32;

    fn headroom(&self) -> u32 {
        crate::config::MBUF_HEADROOM
    }

    /// Bytes the device may write into a posted buffer.
    fn usable_size(&self) -> u32 {
        self.data_room_size().saturating_sub(self.headroom())
    }

    /// The memory chunk backing `mbuf`.
    fn region(&self, mbuf: &Mbuf) -> MemRegion;

    /// Number of buffers currently free.
    fn available(&self) -> usize;
}
