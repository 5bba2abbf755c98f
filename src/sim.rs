//! A software device-control layer.
//!
//! Keeps the object graph a real device would (work queues reference their
//! completion queue, tables reference work queues, the hash QP references
//! the table) and refuses the same things a device refuses: destroying an
//! object that is still referenced, querying an unbound ring, overrunning a
//! work queue, ringing a doorbell for a queue that is gone. Any operation
//! can be made to fail on demand.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use arrayvec::ArrayVec;
use log::trace;
use nix::errno::Errno;

use crate::api::{
    CqInfo, DeviceControl, DoorbellPage, GDMA_WQE_ALIGNMENT_UNIT_SIZE, MemRegion, ObjectKind,
    PostedWqeInfo, QueueType, RawHandle, RqInfo, RxObjects, SglElement, WorkQueue, WorkRequest,
    WqAttr, wqe_size_in_bu,
};
use crate::rss::RxHashConf;

pub const SIM_DB_PAGE: DoorbellPage = DoorbellPage(0xdb000);
pub const MAX_SGE: usize = 4;
const DEFAULT_MAX_MR_LEN: usize = 1 << 30;
const FIRST_LKEY: u32 = 0x1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateCq,
    CreateWq,
    CreateIndTable,
    CreateHashQp,
    Destroy,
    Query,
    Register,
    Post,
    Doorbell,
}

/// A work request as the device saw it.
#[derive(Clone, Debug)]
pub struct PostedWqe {
    pub wq_id: u32,
    pub sgl: ArrayVec<SglElement, MAX_SGE>,
    pub wqe_size_in_bu: u32,
}

#[derive(Debug)]
struct SimObject {
    kind: ObjectKind,
    entries: u32,
    refs: Vec<u64>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    objects: BTreeMap<u64, SimObject>,
    created: usize,
    destroyed: Vec<(ObjectKind, RawHandle)>,
    faults: HashMap<SimOp, (usize, Errno)>,
    registrations: Vec<MemRegion>,
    posted: Vec<PostedWqe>,
    doorbells: Vec<(u32, u32)>,
    last_ind_table_log_size: Option<u32>,
    last_hash_conf: Option<RxHashConf>,
}

impl SimState {
    fn check_fault(&mut self, op: SimOp) -> io::Result<()> {
        if let Some((after, errno)) = self.faults.get_mut(&op) {
            if *after == 0 {
                let errno = *errno;
                self.faults.remove(&op);
                trace!("sim: injected {errno} on {op:?}");
                return Err(errno.into());
            }
            *after -= 1;
        }
        Ok(())
    }

    fn live(&self, handle: u64, kind: ObjectKind) -> bool {
        self.objects.get(&handle).is_some_and(|o| o.kind == kind)
    }

    fn insert(&mut self, kind: ObjectKind, entries: u32, refs: Vec<u64>) -> RawHandle {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.objects.insert(
            handle,
            SimObject {
                kind,
                entries,
                refs,
            },
        );
        self.created += 1;
        trace!("sim: created {kind:?} {handle}");
        RawHandle(handle)
    }

    fn referenced(&self, handle: u64) -> bool {
        self.objects.values().any(|o| o.refs.contains(&handle))
    }

    /// A work queue is bound once a live hash QP reaches it through a table.
    fn bound(&self, wq: u64) -> bool {
        self.objects
            .values()
            .filter(|o| o.kind == ObjectKind::HashQp)
            .flat_map(|qp| qp.refs.iter())
            .filter_map(|t| self.objects.get(t))
            .any(|table| table.refs.contains(&wq))
    }

    fn wq_by_id(&self, id: u32) -> Option<&SimObject> {
        self.objects
            .get(&(id as u64))
            .filter(|o| o.kind == ObjectKind::Wq)
    }
}

pub struct SimDevice {
    state: Mutex<SimState>,
    max_mr_len: usize,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            max_mr_len: DEFAULT_MAX_MR_LEN,
        }
    }

    /// Regions larger than `len` are refused with `E2BIG`.
    pub fn with_max_mr_len(mut self, len: usize) -> Self {
        self.max_mr_len = len;
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lets `after` calls of `op` succeed, then fails the next one with
    /// `errno`.
    pub fn fail_next(&self, op: SimOp, after: usize, errno: Errno) {
        self.state().faults.insert(op, (after, errno));
    }

    pub fn live_objects(&self) -> usize {
        self.state().objects.len()
    }

    pub fn live_of(&self, kind: ObjectKind) -> usize {
        self.state()
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .count()
    }

    /// Objects created so far, live or not.
    pub fn created(&self) -> usize {
        self.state().created
    }

    /// Successful destroys, in order.
    pub fn destroyed(&self) -> Vec<(ObjectKind, RawHandle)> {
        self.state().destroyed.clone()
    }

    pub fn registrations(&self) -> usize {
        self.state().registrations.len()
    }

    pub fn posted(&self) -> Vec<PostedWqe> {
        self.state().posted.clone()
    }

    /// `(queue id, tail in bytes)` for every doorbell rung.
    pub fn doorbells(&self) -> Vec<(u32, u32)> {
        self.state().doorbells.clone()
    }

    pub fn last_ind_table_log_size(&self) -> Option<u32> {
        self.state().last_ind_table_log_size
    }

    pub fn last_hash_conf(&self) -> Option<RxHashConf> {
        self.state().last_hash_conf.clone()
    }
}

impl DeviceControl for SimDevice {
    fn create_cq(&self, entries: u32, _socket: i32) -> io::Result<RawHandle> {
        let mut st = self.state();
        st.check_fault(SimOp::CreateCq)?;
        if entries == 0 {
            return Err(Errno::EINVAL.into());
        }
        Ok(st.insert(ObjectKind::Cq, entries, Vec::new()))
    }

    fn create_wq(&self, attr: &WqAttr) -> io::Result<RawHandle> {
        let mut st = self.state();
        st.check_fault(SimOp::CreateWq)?;
        if attr.max_wr == 0 || attr.max_sge == 0 || attr.max_sge as usize > MAX_SGE {
            return Err(Errno::EINVAL.into());
        }
        if !st.live(attr.cq.0, ObjectKind::Cq) {
            return Err(Errno::EINVAL.into());
        }
        Ok(st.insert(ObjectKind::Wq, attr.max_wr, vec![attr.cq.0]))
    }

    fn create_ind_table(&self, log_size: u32, wqs: &[RawHandle]) -> io::Result<RawHandle> {
        let mut st = self.state();
        st.check_fault(SimOp::CreateIndTable)?;
        if wqs.is_empty() || wqs.len() > 1usize << log_size {
            return Err(Errno::EINVAL.into());
        }
        if !wqs.iter().all(|wq| st.live(wq.0, ObjectKind::Wq)) {
            return Err(Errno::EINVAL.into());
        }
        st.last_ind_table_log_size = Some(log_size);
        let refs = wqs.iter().map(|wq| wq.0).collect();
        Ok(st.insert(ObjectKind::IndTable, wqs.len() as u32, refs))
    }

    fn create_hash_qp(&self, ind_table: RawHandle, conf: &RxHashConf) -> io::Result<RawHandle> {
        let mut st = self.state();
        st.check_fault(SimOp::CreateHashQp)?;
        if !st.live(ind_table.0, ObjectKind::IndTable) {
            return Err(Errno::EINVAL.into());
        }
        st.last_hash_conf = Some(conf.clone());
        Ok(st.insert(ObjectKind::HashQp, 0, vec![ind_table.0]))
    }

    fn destroy(&self, kind: ObjectKind, handle: RawHandle) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(SimOp::Destroy)?;
        if !st.live(handle.0, kind) {
            return Err(Errno::ENOENT.into());
        }
        if st.referenced(handle.0) {
            return Err(Errno::EBUSY.into());
        }
        st.objects.remove(&handle.0);
        st.destroyed.push((kind, handle));
        trace!("sim: destroyed {kind:?} {}", handle.0);
        Ok(())
    }

    fn query_rx_objects(&self, cq: RawHandle, wq: RawHandle) -> io::Result<RxObjects> {
        let mut st = self.state();
        st.check_fault(SimOp::Query)?;
        let (Some(cq_obj), Some(wq_obj)) = (st.objects.get(&cq.0), st.objects.get(&wq.0)) else {
            return Err(Errno::ENOENT.into());
        };
        if cq_obj.kind != ObjectKind::Cq || wq_obj.kind != ObjectKind::Wq {
            return Err(Errno::EINVAL.into());
        }
        if !st.bound(wq.0) {
            return Err(Errno::EINVAL.into());
        }
        Ok(RxObjects {
            cq: CqInfo {
                buffer: (cq.0 as usize) << 20,
                count: cq_obj.entries,
                id: cq.0 as u32,
            },
            rq: RqInfo {
                buffer: (wq.0 as usize) << 20,
                count: wq_obj.entries,
                size: wq_obj.entries * GDMA_WQE_ALIGNMENT_UNIT_SIZE,
                id: wq.0 as u32,
            },
            db_page: SIM_DB_PAGE,
        })
    }

    fn register_memory(&self, region: MemRegion) -> io::Result<u32> {
        let mut st = self.state();
        st.check_fault(SimOp::Register)?;
        if region.addr == 0 || region.len == 0 {
            return Err(Errno::EINVAL.into());
        }
        if region.len > self.max_mr_len {
            return Err(Errno::E2BIG.into());
        }
        st.registrations.push(region);
        Ok(FIRST_LKEY + st.registrations.len() as u32 - 1)
    }

    fn post_work_request(
        &self,
        wq: &mut WorkQueue,
        req: &WorkRequest<'_>,
    ) -> io::Result<PostedWqeInfo> {
        let mut st = self.state();
        st.check_fault(SimOp::Post)?;
        if st.wq_by_id(wq.id).is_none() {
            return Err(Errno::ENODEV.into());
        }
        if req.sgl.is_empty() || req.sgl.len() > MAX_SGE {
            return Err(Errno::EINVAL.into());
        }
        let sgl: ArrayVec<SglElement, MAX_SGE> = req.sgl.iter().copied().collect();
        let bu = wqe_size_in_bu(sgl.len(), req.inline_oob.len());
        if bu * GDMA_WQE_ALIGNMENT_UNIT_SIZE > wq.free_bytes() {
            return Err(Errno::EBUSY.into());
        }

        let info = PostedWqeInfo {
            wqe_index: wq.head,
            wqe_size_in_bu: bu,
        };
        wq.head = wq.head.wrapping_add(bu);
        st.posted.push(PostedWqe {
            wq_id: wq.id,
            sgl,
            wqe_size_in_bu: bu,
        });
        Ok(info)
    }

    fn ring_doorbell(
        &self,
        page: DoorbellPage,
        queue_type: QueueType,
        queue_id: u32,
        tail: u32,
    ) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(SimOp::Doorbell)?;
        if page != SIM_DB_PAGE || queue_type != QueueType::Receive {
            return Err(Errno::EINVAL.into());
        }
        if st.wq_by_id(queue_id).is_none() {
            return Err(Errno::ENODEV.into());
        }
        st.doorbells.push((queue_id, tail));
        Ok(())
    }
}
