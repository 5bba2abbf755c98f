//! Seams between the rx ring engine and the things it drives: the buffer
//! pool it draws from and the device control layer it programs.

mod buffer;
mod device;
mod handle;

pub use buffer::{BufferDesc, Mbuf, MemRegion, Mempool};
pub use device::{
    COMP_ENTRY_SIZE, CompletionQueue, CqInfo, DeviceControl, DoorbellPage,
    GDMA_WQE_ALIGNMENT_UNIT_SIZE, NOT_USING_CLIENT_DATA_UNIT, ObjectKind, PostedWqeInfo,
    QueueType, RawHandle, RqInfo, RxObjects, SglElement, WorkQueue, WorkRequest, WqAttr,
    wqe_size_in_bu,
};
pub use handle::DevObject;
