//! Asynchronous block I/O: device files, request handles, statistics.

mod disk;
mod request;
mod stats;

pub use disk::DiskManager;
pub use request::Request;
pub use stats::{DeviceStats, IoStats, ScopedStats, StatsSnapshot, WaitKind};
