//! Bounded pools of reusable in-memory blocks: hint-based prefetching and
//! buffered asynchronous writing with BID-tracked steal-back.

mod prefetch;
mod read_write;
mod write;

pub use prefetch::PrefetchPool;
pub use read_write::ReadWritePool;
pub use write::WritePool;
