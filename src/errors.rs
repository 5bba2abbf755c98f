use std::io;

use thiserror::Error;

/// The device refused to register a memory region.
#[derive(Error, Debug)]
#[error("can't register memory region {addr:#x}+{len}: {source}")]
pub struct RegistrationError {
    pub addr: usize,
    pub len: usize,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("descriptor ring is full")]
    RingFull,
    #[error("work request rejected: {0}")]
    Rejected(#[source] io::Error),
}

impl SubmissionError {
    pub fn is_ring_full(&self) -> bool {
        matches!(self, SubmissionError::RingFull)
    }
}

#[derive(Error, Debug)]
pub enum PostError {
    #[error("Can't allocate rx buffer")]
    OutOfBuffers,
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// A batch post stopped early. `posted` descriptors are live on the ring.
#[derive(Error, Debug)]
#[error("posted {posted} descriptors before failing: {source}")]
pub struct PartialPost {
    pub posted: usize,
    #[source]
    pub source: PostError,
}

#[derive(Error, Debug)]
#[error("failed to ring rx doorbell for queue {queue}: {source}")]
pub struct DoorbellError {
    pub queue: u16,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("queue count {0} out of range")]
    QueueCount(usize),
    #[error("ring size {0} must be a non-zero power of two not above {max}", max = crate::config::MAX_RING_SIZE)]
    RingSize(u32),
    #[error("hash key must be {expected} bytes, got {got}")]
    HashKeyLength { expected: usize, got: usize },
    #[error("buffer data room {0} below minimum {min}", min = crate::config::MIN_BUF_SIZE)]
    BufferTooSmall(u32),
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("rx queues already started")]
    AlreadyStarted,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create rx cq for queue {queue}: {source}")]
    CreateCq {
        queue: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to create rx wq for queue {queue}: {source}")]
    CreateWq {
        queue: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to create indirection table: {0}")]
    IndirectionTable(#[source] io::Error),
    #[error("failed to create hash qp: {0}")]
    HashQp(#[source] io::Error),
    #[error("failed to query runtime objects for queue {queue}: {source}")]
    Query {
        queue: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to fill rx queue {queue}: {source}")]
    Fill {
        queue: u16,
        #[source]
        source: PartialPost,
    },
    #[error(transparent)]
    Doorbell(#[from] DoorbellError),
}

#[derive(Error, Debug)]
pub enum RefillError {
    #[error(transparent)]
    Post(#[from] PartialPost),
    #[error(transparent)]
    Doorbell(#[from] DoorbellError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("adapter {0} already registered")]
    Duplicate(String),
    #[error("adapter {0} not found")]
    NotFound(String),
    #[error("vport count {0} out of range")]
    VportCount(u16),
}
