use std::alloc::{self, Layout};
use std::io::{self, Error, ErrorKind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::ArrayQueue;
use libc::{_SC_PAGESIZE, sysconf};
use log::error;

use crate::api::{BufferDesc, Mbuf, MemRegion, Mempool};
use crate::config::MBUF_HEADROOM;

fn page_aligned_layout(size: usize) -> io::Result<Layout> {
    let page_size = match unsafe { sysconf(_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    Layout::from_size_align(size, page_size)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "Invalid layout"))
}

/// A single page-aligned slab cut into equally sized buffers.
///
/// The free list is a bounded lock-free queue, so the pool can be shared by
/// every rx queue of a port.
pub struct HeapPool {
    mem: NonNull<u8>,
    layout: Layout,
    data_room: u32,
    nslots: usize,
    free_list: ArrayQueue<usize>,
    // true while the slot is handed out
    owned: Box<[AtomicBool]>,
}

unsafe impl Send for HeapPool {}
unsafe impl Sync for HeapPool {}

impl HeapPool {
    /// `data_room` is the per-buffer size including [`MBUF_HEADROOM`].
    pub fn new(nslots: usize, data_room: u32) -> io::Result<Self> {
        if nslots == 0 || data_room <= MBUF_HEADROOM {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "pool needs at least one slot larger than the headroom",
            ));
        }
        let size = nslots
            .checked_mul(data_room as usize)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "pool too large"))?;
        let layout = page_aligned_layout(size)?;
        let mem = NonNull::new(unsafe { alloc::alloc(layout) }).ok_or_else(|| {
            Error::new(ErrorKind::OutOfMemory, "Allocation with page alignment failed")
        })?;

        let free_list = ArrayQueue::new(nslots);
        for i in 0..nslots {
            // capacity is exactly nslots
            let _ = free_list.push(i);
        }

        Ok(Self {
            mem,
            layout,
            data_room,
            nslots,
            free_list,
            owned: (0..nslots).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.nslots
    }

    pub fn is_empty(&self) -> bool {
        self.nslots == 0
    }

    /// Buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.nslots - self.free_list.len()
    }

    fn slot_addr(&self, idx: usize) -> usize {
        self.mem.as_ptr() as usize + idx * self.data_room as usize + MBUF_HEADROOM as usize
    }

    fn slot_data(&self, idx: usize) -> NonNull<u8> {
        let offset = idx * self.data_room as usize + MBUF_HEADROOM as usize;
        // in bounds: idx < nslots and headroom < data_room
        unsafe { self.mem.add(offset) }
    }
}

impl Mempool for HeapPool {
    fn alloc(&self) -> Option<Mbuf> {
        let idx = self.free_list.pop()?;
        self.owned[idx].store(true, Ordering::Release);
        Some(Mbuf::new(BufferDesc::from(idx), self.slot_data(idx)))
    }

    /// Takes back a buffer this pool handed out. Buffers from elsewhere and
    /// repeated frees are logged and dropped, never queued.
    fn free(&self, mbuf: Mbuf) {
        let idx = usize::from(mbuf.desc());
        if idx >= self.nslots || mbuf.addr() != self.slot_addr(idx) {
            error!(
                "buffer {idx} at {:#x} does not belong to this pool",
                mbuf.addr()
            );
            return;
        }
        if !self.owned[idx].swap(false, Ordering::AcqRel) {
            error!("buffer {idx} freed twice");
            return;
        }
        if self.free_list.push(idx).is_err() {
            error!("free list overflow on buffer {idx}");
        }
    }

    fn data_room_size(&self) -> u32 {
        self.data_room
    }

    fn region(&self, _mbuf: &Mbuf) -> MemRegion {
        MemRegion {
            addr: self.mem.as_ptr() as usize,
            len: self.layout.size(),
        }
    }

    fn available(&self) -> usize {
        self.free_list.len()
    }
}

impl Drop for HeapPool {
    fn drop(&mut self) {
        if self.in_use() != 0 {
            error!("pool dropped with {} buffers outstanding", self.in_use());
        }
        unsafe { alloc::dealloc(self.mem.as_ptr(), self.layout) };
    }
}
