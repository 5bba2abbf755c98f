//! One receive queue: posts buffers to the device, remembers which buffer
//! went into which slot, and hands them back on completion or teardown.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use log::{debug, error, info, trace};
use nix::errno::Errno;

use crate::api::{
    COMP_ENTRY_SIZE, CompletionQueue, DevObject, DeviceControl, DoorbellPage,
    GDMA_WQE_ALIGNMENT_UNIT_SIZE, Mbuf, Mempool, NOT_USING_CLIENT_DATA_UNIT, ObjectKind,
    QueueType, RawHandle, RxObjects, SglElement, WorkQueue, WorkRequest, WqAttr,
};
use crate::errors::{
    ConfigError, DoorbellError, PartialPost, PostError, RefillError, StartError, SubmissionError,
};
use crate::mr_cache::MrCache;
use crate::ring::{DescRing, RxDesc};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxStats {
    /// Allocation attempts that found the pool empty.
    pub nombuf: u64,
    pub posted: u64,
    pub post_errors: u64,
    pub completed: u64,
    pub drained: u64,
    pub doorbells: u64,
}

pub struct RxQueue {
    id: u16,
    socket: i32,
    device: Arc<dyn DeviceControl>,
    pool: Arc<dyn Mempool>,
    mr: MrCache,
    desc_ring: DescRing,
    cq: DevObject,
    wq: DevObject,
    gdma_rq: WorkQueue,
    gdma_cq: CompletionQueue,
    db_page: Option<DoorbellPage>,
    stats: RxStats,
}

impl RxQueue {
    pub fn new(
        id: u16,
        ring_size: u32,
        socket: i32,
        device: Arc<dyn DeviceControl>,
        pool: Arc<dyn Mempool>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            id,
            socket,
            mr: MrCache::new(device.clone()),
            device,
            pool,
            desc_ring: DescRing::new(ring_size)?,
            cq: DevObject::empty(ObjectKind::Cq),
            wq: DevObject::empty(ObjectKind::Wq),
            gdma_rq: WorkQueue::default(),
            gdma_cq: CompletionQueue::default(),
            db_page: None,
            stats: RxStats::default(),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn capacity(&self) -> u32 {
        self.desc_ring.capacity()
    }

    /// Buffers currently owned by the device.
    pub fn outstanding(&self) -> u32 {
        self.desc_ring.len()
    }

    pub fn desc_ring(&self) -> &DescRing {
        &self.desc_ring
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    pub fn mr_cache(&self) -> &MrCache {
        &self.mr
    }

    pub fn work_queue(&self) -> &WorkQueue {
        &self.gdma_rq
    }

    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.gdma_cq
    }

    pub fn cq_handle(&self) -> Option<RawHandle> {
        self.cq.raw()
    }

    pub fn wq_handle(&self) -> Option<RawHandle> {
        self.wq.raw()
    }

    /// True when no hardware object or runtime address is held.
    pub fn is_hw_empty(&self) -> bool {
        self.cq.is_empty()
            && self.wq.is_empty()
            && self.db_page.is_none()
            && self.gdma_rq == WorkQueue::default()
            && self.gdma_cq == CompletionQueue::default()
    }

    /// Creates the completion queue, then the work queue feeding it.
    /// Returns the work queue handle for the indirection table.
    pub(crate) fn create_objects(&mut self) -> Result<RawHandle, StartError> {
        let entries = self.capacity();
        let queue = self.id;

        let cq = self
            .device
            .create_cq(entries, self.socket)
            .map_err(|source| {
                error!("failed to create rx cq queue {queue}");
                StartError::CreateCq { queue, source }
            })?;
        self.cq = DevObject::new(ObjectKind::Cq, cq, self.device.clone());

        let attr = WqAttr {
            max_wr: entries,
            max_sge: 1,
            cq,
            socket: self.socket,
        };
        let wq = self.device.create_wq(&attr).map_err(|source| {
            error!("failed to create rx wq {queue}");
            StartError::CreateWq { queue, source }
        })?;
        self.wq = DevObject::new(ObjectKind::Wq, wq, self.device.clone());
        Ok(wq)
    }

    /// Picks up the ring addresses the device assigned once the hash QP
    /// bound this queue.
    pub(crate) fn query_objects(&mut self) -> Result<(), StartError> {
        let queue = self.id;
        let (Some(cq), Some(wq)) = (self.cq.raw(), self.wq.raw()) else {
            return Err(StartError::Query {
                queue,
                source: io::Error::from(Errno::ENODEV),
            });
        };
        let objs = self.device.query_rx_objects(cq, wq).map_err(|source| {
            error!("query of rx objects failed for queue {queue}: {source}");
            StartError::Query { queue, source }
        })?;
        self.set_runtime(objs);
        Ok(())
    }

    fn set_runtime(&mut self, objs: RxObjects) {
        self.gdma_cq = CompletionQueue {
            id: objs.cq.id,
            buffer: objs.cq.buffer,
            count: objs.cq.count,
            size: objs.cq.count * COMP_ENTRY_SIZE,
            // cq head starts with count
            head: objs.cq.count,
        };
        info!(
            "rxq {} cq id {} buf {:#x} count {} size {}",
            self.id, self.gdma_cq.id, self.gdma_cq.buffer, self.gdma_cq.count, self.gdma_cq.size
        );

        self.gdma_rq = WorkQueue {
            id: objs.rq.id,
            buffer: objs.rq.buffer,
            count: objs.rq.count,
            size: objs.rq.size,
            head: 0,
            tail: 0,
        };
        info!(
            "rxq {} rq id {} buf {:#x} count {} size {}",
            self.id, self.gdma_rq.id, self.gdma_rq.buffer, self.gdma_rq.count, self.gdma_rq.size
        );
        self.db_page = Some(objs.db_page);
    }

    /// Allocates one buffer, registers it and posts it at the ring head.
    ///
    /// On any failure the buffer goes back to the pool and the cursors are
    /// left untouched.
    pub fn post_one(&mut self) -> Result<(), PostError> {
        if self.desc_ring.is_full() {
            return Err(SubmissionError::RingFull.into());
        }

        let Some(mbuf) = self.pool.alloc() else {
            self.stats.nombuf += 1;
            return Err(PostError::OutOfBuffers);
        };

        let lkey = match self.mr.resolve(&*self.pool, &mbuf) {
            Ok(lkey) => lkey,
            Err(e) => {
                error!("failed to register RX MR: {e}");
                self.stats.post_errors += 1;
                self.pool.free(mbuf);
                return Err(e.into());
            }
        };

        let sgl = [SglElement {
            address: (mbuf.addr() as u64).to_le(),
            memory_key: lkey,
            size: self.pool.usable_size(),
        }];
        let request = WorkRequest {
            sgl: &sgl,
            inline_oob: &[],
            flags: 0,
            client_data_unit: NOT_USING_CLIENT_DATA_UNIT,
        };

        match self.device.post_work_request(&mut self.gdma_rq, &request) {
            Ok(info) => {
                let desc = RxDesc {
                    mbuf,
                    wqe_size_in_bu: info.wqe_size_in_bu,
                };
                if let Err(desc) = self.desc_ring.push(desc) {
                    // not yet covered by a doorbell, so the wqe can be withdrawn
                    error!("rxq {} descriptor ring full after post", self.id);
                    self.gdma_rq.head = self.gdma_rq.head.wrapping_sub(desc.wqe_size_in_bu);
                    self.stats.post_errors += 1;
                    self.pool.free(desc.mbuf);
                    return Err(SubmissionError::RingFull.into());
                }
                self.stats.posted += 1;
                Ok(())
            }
            Err(e) => {
                error!("failed to post recv ret {e}");
                self.stats.post_errors += 1;
                self.pool.free(mbuf);
                Err(SubmissionError::Rejected(e).into())
            }
        }
    }

    /// Posts `count` buffers in order, stopping at the first failure.
    pub fn post_many(&mut self, count: usize) -> Result<usize, PartialPost> {
        for posted in 0..count {
            if let Err(source) = self.post_one() {
                return Err(PartialPost { posted, source });
            }
        }
        Ok(count)
    }

    /// Posts into every free slot.
    pub fn fill(&mut self) -> Result<usize, PartialPost> {
        let free = self.desc_ring.cursor().free() as usize;
        let posted = self.post_many(free)?;
        debug!("rxq {} posted {posted} buffers", self.id);
        Ok(posted)
    }

    /// Tells the device about everything posted so far.
    pub fn ring_doorbell(&mut self) -> Result<(), DoorbellError> {
        let queue = self.id;
        let Some(page) = self.db_page else {
            error!("failed to ring RX doorbell: rxq {queue} has no doorbell page");
            return Err(DoorbellError {
                queue,
                source: io::Error::from(Errno::ENODEV),
            });
        };

        // descriptor writes must be visible before the device is told
        fence(Ordering::Release);
        let tail = self.gdma_rq.head.wrapping_mul(GDMA_WQE_ALIGNMENT_UNIT_SIZE);
        self.device
            .ring_doorbell(page, QueueType::Receive, self.gdma_rq.id, tail)
            .map_err(|source| {
                error!("failed to ring RX doorbell ret {source}");
                DoorbellError { queue, source }
            })?;
        self.stats.doorbells += 1;
        Ok(())
    }

    /// Tops the ring up and rings the doorbell once if anything was posted.
    /// A short fill (for example an exhausted pool) still publishes what
    /// made it onto the ring.
    pub fn refill(&mut self) -> Result<usize, RefillError> {
        let res = self.fill();
        let posted = match &res {
            Ok(n) => *n,
            Err(p) => p.posted,
        };
        if posted > 0 {
            self.ring_doorbell()?;
        }
        trace!("rxq {} refill posted {posted}", self.id);
        res.map_err(RefillError::from)
    }

    /// Takes the oldest posted buffer once the device has reported it
    /// complete, returning its work-queue space.
    pub fn pop_completed(&mut self) -> Option<Mbuf> {
        let desc = self.desc_ring.pop()?;
        self.gdma_rq.tail = self.gdma_rq.tail.wrapping_add(desc.wqe_size_in_bu);
        self.stats.completed += 1;
        Some(desc.mbuf)
    }

    /// Returns every outstanding buffer to the pool and rewinds the ring.
    /// Only call once the device can no longer write into them.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        for desc in self.desc_ring.drain() {
            self.pool.free(desc.mbuf);
            n += 1;
        }
        self.stats.drained += n as u64;
        n
    }

    /// Destroys the work queue and its completion queue, then reclaims
    /// every posted buffer and clears the runtime state. Safe on a queue
    /// that was never started.
    pub(crate) fn stop(&mut self) {
        if let Err(e) = self.wq.destroy() {
            error!("rx_queue destroy_wq failed {e}");
        }
        if let Err(e) = self.cq.destroy() {
            error!("rx_queue destroy_cq failed {e}");
        }

        // destroy is synchronous, so no DMA targets the buffers past here
        fence(Ordering::SeqCst);
        let drained = self.drain();
        if drained > 0 {
            debug!("rxq {} drained {drained} buffers", self.id);
        }

        self.gdma_rq = WorkQueue::default();
        self.gdma_cq = CompletionQueue::default();
        self.db_page = None;
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use nix::errno::Errno;

    use super::*;
    use crate::api::MemRegion;
    use crate::buffer_pool::HeapPool;
    use crate::rss::RssConf;
    use crate::sim::{SimDevice, SimOp};

    /// A queue whose objects exist and are bound, as after port start but
    /// before the initial fill.
    fn bound_queue<P: Mempool + 'static>(
        sim: &Arc<SimDevice>,
        pool: &Arc<P>,
        ring: u32,
    ) -> RxQueue {
        let mut q = RxQueue::new(0, ring, 0, sim.clone(), pool.clone()).unwrap();
        let wq = q.create_objects().unwrap();
        let ind = sim.create_ind_table(0, &[wq]).unwrap();
        let conf = RssConf::default().hash_conf().unwrap();
        let qp = sim.create_hash_qp(ind, &conf).unwrap();
        q.query_objects().unwrap();
        // unbind again so the test owns nothing but the queue objects
        sim.destroy(ObjectKind::HashQp, qp).unwrap();
        sim.destroy(ObjectKind::IndTable, ind).unwrap();
        q
    }

    #[test]
    fn posts_until_full_then_refuses() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(64, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        assert_eq!(q.fill().unwrap(), 8);
        assert_eq!(q.outstanding(), 8);
        assert_eq!(q.desc_ring().occupied(), 8);
        assert_eq!(pool.in_use(), 8);

        let head = q.desc_ring().cursor().head();
        let wq_head = q.work_queue().head;
        let err = q.post_one().unwrap_err();
        assert!(matches!(err, PostError::Submission(ref s) if s.is_ring_full()));
        assert_eq!(q.desc_ring().cursor().head(), head);
        assert_eq!(q.desc_ring().cursor().tail(), 0);
        assert_eq!(q.work_queue().head, wq_head);
        assert_eq!(pool.in_use(), 8);
    }

    #[test]
    fn exhausted_pool_reports_partial_batch() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(5, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        let err = q.post_many(8).unwrap_err();
        assert_eq!(err.posted, 5);
        assert!(matches!(err.source, PostError::OutOfBuffers));
        assert_eq!(q.stats().nombuf, 1);
        assert_eq!(q.outstanding(), 5);
    }

    #[test]
    fn rejected_work_request_returns_buffer() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(16, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        q.post_many(3).unwrap();
        sim.fail_next(SimOp::Post, 0, Errno::EBUSY);
        let err = q.post_one().unwrap_err();
        assert!(matches!(err, PostError::Submission(SubmissionError::Rejected(_))));
        assert_eq!(q.outstanding(), 3);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(q.stats().post_errors, 1);
    }

    #[test]
    fn registration_failure_frees_buffer() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(16, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        sim.fail_next(SimOp::Register, 0, Errno::EFAULT);
        let err = q.post_one().unwrap_err();
        assert!(matches!(err, PostError::Registration(_)));
        assert_eq!(pool.in_use(), 0);
        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn doorbell_carries_head_in_bytes() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(16, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        q.post_many(5).unwrap();
        q.ring_doorbell().unwrap();
        let wq_id = q.work_queue().id;
        assert_eq!(
            sim.doorbells().last().copied(),
            Some((wq_id, 5 * GDMA_WQE_ALIGNMENT_UNIT_SIZE))
        );
        assert_eq!(q.stats().doorbells, 1);
    }

    #[test]
    fn doorbell_without_runtime_state_fails() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(4, 2048).unwrap());
        let mut q = RxQueue::new(3, 4, 0, sim.clone(), pool.clone()).unwrap();
        let err = q.ring_doorbell().unwrap_err();
        assert_eq!(err.queue, 3);
        assert!(sim.doorbells().is_empty());
    }

    #[test]
    fn completion_frees_work_queue_space_in_order() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(16, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 4);

        q.fill().unwrap();
        let mbuf = q.pop_completed().unwrap();
        assert_eq!(q.work_queue().tail, 1);
        assert_eq!(q.outstanding(), 3);
        pool.free(mbuf);

        // the freed slot is reusable
        q.post_one().unwrap();
        assert_eq!(q.outstanding(), 4);
        assert_eq!(q.desc_ring().cursor().head(), 5);
    }

    #[test]
    fn refill_rings_once_and_publishes_short_fill() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(6, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        let err = q.refill().unwrap_err();
        assert!(matches!(err, RefillError::Post(ref p) if p.posted == 6));
        assert_eq!(sim.doorbells().len(), 1);

        // nothing to post: no doorbell
        let err = q.refill().unwrap_err();
        assert!(matches!(err, RefillError::Post(ref p) if p.posted == 0));
        assert_eq!(sim.doorbells().len(), 1);
    }

    #[test]
    fn drain_releases_exactly_outstanding() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(16, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);

        q.post_many(6).unwrap();
        let done = q.pop_completed().unwrap();
        pool.free(done);
        assert_eq!(q.drain(), 5);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(q.desc_ring().cursor().head(), 0);
        assert_eq!(q.desc_ring().cursor().tail(), 0);
    }

    /// Counts frees that happen while the device still holds queue objects.
    struct WatchedPool {
        inner: HeapPool,
        sim: Arc<SimDevice>,
        frees: AtomicUsize,
        early_frees: AtomicUsize,
    }

    impl Mempool for WatchedPool {
        fn alloc(&self) -> Option<Mbuf> {
            self.inner.alloc()
        }

        fn free(&self, mbuf: Mbuf) {
            self.frees.fetch_add(1, Ordering::Relaxed);
            if self.sim.live_of(ObjectKind::Wq) + self.sim.live_of(ObjectKind::Cq) != 0 {
                self.early_frees.fetch_add(1, Ordering::Relaxed);
            }
            self.inner.free(mbuf);
        }

        fn data_room_size(&self) -> u32 {
            self.inner.data_room_size()
        }

        fn region(&self, mbuf: &Mbuf) -> MemRegion {
            self.inner.region(mbuf)
        }

        fn available(&self) -> usize {
            self.inner.available()
        }
    }

    #[test]
    fn stop_frees_only_after_objects_are_gone() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(WatchedPool {
            inner: HeapPool::new(16, 2048).unwrap(),
            sim: sim.clone(),
            frees: AtomicUsize::new(0),
            early_frees: AtomicUsize::new(0),
        });
        let mut q = bound_queue(&sim, &pool, 8);
        q.fill().unwrap();

        q.stop();
        assert_eq!(pool.frees.load(Ordering::Relaxed), 8);
        assert_eq!(pool.early_frees.load(Ordering::Relaxed), 0);
        assert_eq!(pool.inner.in_use(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let sim = Arc::new(SimDevice::new());
        let pool = Arc::new(HeapPool::new(16, 2048).unwrap());
        let mut q = bound_queue(&sim, &pool, 8);
        q.fill().unwrap();

        q.stop();
        assert!(q.is_hw_empty());
        assert_eq!(pool.in_use(), 0);
        assert_eq!(sim.live_objects(), 0);

        q.stop();
        assert_eq!(q.stats().drained, 8);
    }
}
