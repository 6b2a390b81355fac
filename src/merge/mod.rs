//! K-way merge machinery: the internal loser tree and the external merger
//! over on-disk block sequences.

mod ext_merger;
mod loser_tree;

pub use ext_merger::ExtMerger;
pub use loser_tree::{LoserTree, SliceMerger};

pub(crate) use loser_tree::{merge2, merge3, merge4};
