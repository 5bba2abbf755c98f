//! Descriptor ring: which buffer sits in which submitted hardware slot.

use log::error;

use crate::api::Mbuf;
use crate::config::check_ring_size;
use crate::errors::ConfigError;

/// Head/tail pair over a power-of-two ring.
///
/// Both cursors run freely and are masked on access, so `head - tail` is
/// the occupancy and a full ring is distinguishable from an empty one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingCursor {
    head: u32,
    tail: u32,
    mask: u32,
}

impl RingCursor {
    pub fn new(capacity: u32) -> Result<Self, ConfigError> {
        check_ring_size(capacity)?;
        Ok(Self {
            head: 0,
            tail: 0,
            mask: capacity - 1,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    pub fn len(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn free(&self) -> u32 {
        self.capacity() - self.len()
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Claims the slot at head. `None` when the ring is full.
    pub fn advance_head(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let idx = self.head & self.mask;
        self.head = self.head.wrapping_add(1);
        Some(idx as usize)
    }

    /// Releases the slot at tail. `None` when the ring is empty.
    pub fn advance_tail(&mut self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let idx = self.tail & self.mask;
        self.tail = self.tail.wrapping_add(1);
        Some(idx as usize)
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

/// A posted buffer and the work-queue space it took.
#[derive(Debug)]
pub struct RxDesc {
    pub mbuf: Mbuf,
    pub wqe_size_in_bu: u32,
}

#[derive(Debug)]
pub struct DescRing {
    cursor: RingCursor,
    slots: Box<[Option<RxDesc>]>,
}

impl DescRing {
    pub fn new(capacity: u32) -> Result<Self, ConfigError> {
        let cursor = RingCursor::new(capacity)?;
        let slots = (0..capacity).map(|_| None).collect();
        Ok(Self { cursor, slots })
    }

    pub fn cursor(&self) -> &RingCursor {
        &self.cursor
    }

    pub fn capacity(&self) -> u32 {
        self.cursor.capacity()
    }

    pub fn len(&self) -> u32 {
        self.cursor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.cursor.is_full()
    }

    /// Stores `desc` at head. Hands it back when the ring is full.
    pub fn push(&mut self, desc: RxDesc) -> Result<usize, RxDesc> {
        let Some(idx) = self.cursor.advance_head() else {
            return Err(desc);
        };
        let prev = self.slots[idx].replace(desc);
        debug_assert!(prev.is_none(), "slot {idx} reused before reclaim");
        Ok(idx)
    }

    /// Takes the oldest outstanding descriptor.
    pub fn pop(&mut self) -> Option<RxDesc> {
        let idx = self.cursor.advance_tail()?;
        let desc = self.slots[idx].take();
        debug_assert!(desc.is_some(), "slot {idx} empty inside [tail, head)");
        desc
    }

    /// Number of slots holding a buffer.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Takes every outstanding descriptor from tail to head. The cursors
    /// are back at zero once the iterator is dropped; descriptors it never
    /// yielded are lost along with their buffers.
    pub(crate) fn drain(&mut self) -> Drain<'_> {
        Drain { ring: self }
    }
}

pub(crate) struct Drain<'a> {
    ring: &'a mut DescRing,
}

impl Iterator for Drain<'_> {
    type Item = RxDesc;

    fn next(&mut self) -> Option<RxDesc> {
        self.ring.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.ring.len() as usize;
        (n, Some(n))
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        let lost = self.by_ref().count();
        if lost > 0 {
            error!("descriptor ring drain dropped early, {lost} buffers leaked");
        }
        self.ring.cursor.reset();
    }
}
