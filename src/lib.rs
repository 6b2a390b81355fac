//! # extmem
//!
//! External-memory containers: data structures whose capacity exceeds main
//! memory by spilling state to block-addressable storage. The crate provides
//! a parallel external priority queue ([`ppq::ParallelPq`]), a classical
//! sequence-heap priority queue ([`pq::SequenceHeap`]), an ordered map over
//! fixed-size blocks ([`btree::BTree`]), a double-ended queue and a stack
//! family, all coordinated through a shared block manager, block pools and
//! an I/O statistics layer.
//!
//! Containers never create global state implicitly: a [`Runtime`] owns the
//! device files, the block manager and the statistics instance, and is
//! passed to every container as `Arc<Runtime>`.

pub mod btree;
pub mod common;
pub mod deque;
pub mod error;
pub mod io;
pub mod merge;
pub mod pool;
pub mod pq;
pub mod ppq;
pub mod scheduler;
pub mod stack;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;

pub use error::{ExtError, Result};

use io::{DiskManager, IoStats};
use storage::BlockManager;

/// Process-wide configuration: devices, queue depth, default pool sizes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the device files.
    pub data_dir: PathBuf,

    /// One entry per simulated device, giving its capacity in bytes.
    pub device_bytes: Vec<u64>,

    /// Depth of each device's operation queue; a full queue applies
    /// backpressure to submitters.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./extmem-data"),
            device_bytes: vec![1 << 30],
            queue_depth: 16,
        }
    }
}

impl Config {
    /// Convenience for tests and examples: `n` devices of `bytes` each under
    /// `dir`.
    pub fn with_devices(dir: impl Into<PathBuf>, n: usize, bytes: u64) -> Self {
        Self {
            data_dir: dir.into(),
            device_bytes: vec![bytes; n],
            queue_depth: 16,
        }
    }
}

/// Owns the disk backend, the block manager and the statistics instance.
pub struct Runtime {
    config: Config,
    stats: Arc<IoStats>,
    disks: DiskManager,
    block_manager: BlockManager,
}

static GLOBAL: OnceCell<Arc<Runtime>> = OnceCell::new();

impl Runtime {
    pub fn new(config: Config) -> Result<Arc<Runtime>> {
        if cfg!(target_endian = "big") {
            return Err(ExtError::Config(
                "block layouts are little-endian; big-endian hosts are unsupported".into(),
            ));
        }
        if config.device_bytes.is_empty() {
            return Err(ExtError::Config("at least one device is required".into()));
        }
        let stats = Arc::new(IoStats::new(config.device_bytes.len()));
        let disks = DiskManager::new(
            &config.data_dir,
            &config.device_bytes,
            config.queue_depth,
            Arc::clone(&stats),
        )?;
        let block_manager = BlockManager::new(&config.device_bytes)?;
        Ok(Arc::new(Runtime {
            config,
            stats,
            disks,
            block_manager,
        }))
    }

    /// Install a process-wide default instance. Fails if one exists already.
    pub fn init_global(config: Config) -> Result<Arc<Runtime>> {
        let rt = Runtime::new(config)?;
        GLOBAL
            .set(Arc::clone(&rt))
            .map_err(|_| ExtError::Config("global runtime already initialized".into()))?;
        Ok(rt)
    }

    /// The process-wide instance installed by [`init_global`](Runtime::init_global).
    pub fn global() -> Result<Arc<Runtime>> {
        GLOBAL
            .get()
            .cloned()
            .ok_or_else(|| ExtError::Config("global runtime not initialized".into()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    pub fn disks(&self) -> &DiskManager {
        &self.disks
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Joins the device workers and removes the device files. Containers
    /// still alive afterwards fail their next I/O with `ShutDown`.
    pub fn shutdown(&self) {
        self.disks.shutdown();
    }
}
