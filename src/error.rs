use thiserror::Error;

use crate::storage::Bid;

#[derive(Error, Debug)]
pub enum ExtError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on device {device} at offset {offset}: {source}")]
    DeviceIo {
        device: u16,
        offset: u64,
        source: std::io::Error,
    },

    #[error("out of space: no device can hold {requested} more bytes")]
    OutOfSpace { requested: u64 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("cache exhausted: all {slots} slots are pinned")]
    CacheExhausted { slots: usize },

    #[error("precondition violation: {0}")]
    PreconditionViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue poisoned by earlier IO failure on array backed by {bid}")]
    Poisoned { bid: Bid },

    #[error("runtime already shut down")]
    ShutDown,
}

impl ExtError {
    /// Clone-ish helper for errors that must be re-surfaced on every
    /// operation of a poisoned container. `std::io::Error` is not `Clone`,
    /// so the replayed error carries the original's kind and text.
    pub(crate) fn replay(&self) -> ExtError {
        match self {
            ExtError::Io(e) => ExtError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ExtError::DeviceIo {
                device,
                offset,
                source,
            } => ExtError::DeviceIo {
                device: *device,
                offset: *offset,
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            ExtError::OutOfSpace { requested } => ExtError::OutOfSpace {
                requested: *requested,
            },
            ExtError::OutOfMemory(s) => ExtError::OutOfMemory(s.clone()),
            ExtError::CacheExhausted { slots } => ExtError::CacheExhausted { slots: *slots },
            ExtError::PreconditionViolation(s) => ExtError::PreconditionViolation(s.clone()),
            ExtError::Config(s) => ExtError::Config(s.clone()),
            ExtError::Poisoned { bid } => ExtError::Poisoned { bid: *bid },
            ExtError::ShutDown => ExtError::ShutDown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExtError>;
