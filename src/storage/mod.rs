//! Block-level storage: identifiers, typed buffers, allocation.

mod alloc;
mod bid;
mod block;
mod manager;

pub use alloc::{AllocStrategy, FullyRandom, RandomCyclic, SimpleRandom, Striping};
pub use bid::{Bid, BidRepr};
pub use block::{
    read_tail, value_slice, value_slice_mut, write_tail, Block, Pod, RawBuf, BLOCK_ALIGN,
};
pub use manager::BlockManager;
