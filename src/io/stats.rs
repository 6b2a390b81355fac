//! I/O statistics.
//!
//! One [`IoStats`] instance lives in the [`Runtime`](crate::Runtime). Device
//! counters are lock-free atomics updated by the device workers; the
//! process-wide parallel-time integration (how long at least one read/write
//! was in flight) runs under a small mutex taken only at operation start and
//! finish.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ExtError, Result};

// ============================================================================
// Per-device counters
// ============================================================================

#[derive(Debug, Default)]
struct DeviceCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    read_time_us: AtomicU64,
    write_time_us: AtomicU64,
}

/// Immutable snapshot of one device's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub device_id: u16,
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_time_s: f64,
    pub write_time_s: f64,
}

// ============================================================================
// Parallel-time accumulator
// ============================================================================

#[derive(Debug)]
struct ParallelAcc {
    active_reads: u32,
    active_writes: u32,
    read_begin: Instant,
    write_begin: Instant,
    io_begin: Instant,
    parallel_read: Duration,
    parallel_write: Duration,
    parallel_io: Duration,
    wait_read: Duration,
    wait_write: Duration,
}

impl ParallelAcc {
    fn new(now: Instant) -> Self {
        Self {
            active_reads: 0,
            active_writes: 0,
            read_begin: now,
            write_begin: now,
            io_begin: now,
            parallel_read: Duration::ZERO,
            parallel_write: Duration::ZERO,
            parallel_io: Duration::ZERO,
            wait_read: Duration::ZERO,
            wait_write: Duration::ZERO,
        }
    }
}

/// What a `wait()` call was blocked on, for wait-time attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Read,
    Write,
}

// ============================================================================
// IoStats
// ============================================================================

pub struct IoStats {
    devices: Vec<DeviceCounters>,
    par: Mutex<ParallelAcc>,
    start: Instant,
}

impl IoStats {
    pub fn new(num_devices: usize) -> Self {
        let now = Instant::now();
        Self {
            devices: (0..num_devices).map(|_| DeviceCounters::default()).collect(),
            par: Mutex::new(ParallelAcc::new(now)),
            start: now,
        }
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    // ------------------------------------------------------------------
    // Hooks called by the device workers
    // ------------------------------------------------------------------

    pub(crate) fn read_started(&self) {
        let mut p = self.par.lock();
        let now = Instant::now();
        if p.active_reads == 0 {
            p.read_begin = now;
        }
        if p.active_reads + p.active_writes == 0 {
            p.io_begin = now;
        }
        p.active_reads += 1;
    }

    pub(crate) fn read_finished(&self, device: u16, bytes: u64, elapsed: Duration) {
        let c = &self.devices[device as usize];
        c.reads.fetch_add(1, Ordering::Relaxed);
        c.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        c.read_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let mut p = self.par.lock();
        let now = Instant::now();
        p.active_reads -= 1;
        if p.active_reads == 0 {
            let d = now - p.read_begin;
            p.parallel_read += d;
        }
        if p.active_reads + p.active_writes == 0 {
            let d = now - p.io_begin;
            p.parallel_io += d;
        }
    }

    pub(crate) fn write_started(&self) {
        let mut p = self.par.lock();
        let now = Instant::now();
        if p.active_writes == 0 {
            p.write_begin = now;
        }
        if p.active_reads + p.active_writes == 0 {
            p.io_begin = now;
        }
        p.active_writes += 1;
    }

    pub(crate) fn write_finished(&self, device: u16, bytes: u64, elapsed: Duration) {
        let c = &self.devices[device as usize];
        c.writes.fetch_add(1, Ordering::Relaxed);
        c.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        c.write_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let mut p = self.par.lock();
        let now = Instant::now();
        p.active_writes -= 1;
        if p.active_writes == 0 {
            let d = now - p.write_begin;
            p.parallel_write += d;
        }
        if p.active_reads + p.active_writes == 0 {
            let d = now - p.io_begin;
            p.parallel_io += d;
        }
    }

    pub(crate) fn waited(&self, kind: WaitKind, elapsed: Duration) {
        let mut p = self.par.lock();
        match kind {
            WaitKind::Read => p.wait_read += elapsed,
            WaitKind::Write => p.wait_write += elapsed,
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> StatsSnapshot {
        let p = self.par.lock();
        StatsSnapshot {
            devices: self
                .devices
                .iter()
                .enumerate()
                .map(|(i, c)| DeviceStats {
                    device_id: i as u16,
                    reads: c.reads.load(Ordering::Relaxed),
                    writes: c.writes.load(Ordering::Relaxed),
                    read_bytes: c.read_bytes.load(Ordering::Relaxed),
                    write_bytes: c.write_bytes.load(Ordering::Relaxed),
                    read_time_s: c.read_time_us.load(Ordering::Relaxed) as f64 / 1e6,
                    write_time_s: c.write_time_us.load(Ordering::Relaxed) as f64 / 1e6,
                })
                .collect(),
            parallel_read_time: p.parallel_read.as_secs_f64(),
            parallel_write_time: p.parallel_write.as_secs_f64(),
            parallel_io_time: p.parallel_io.as_secs_f64(),
            wait_time_read: p.wait_read.as_secs_f64(),
            wait_time_write: p.wait_write.as_secs_f64(),
            elapsed: self.start.elapsed().as_secs_f64(),
        }
    }
}

// ============================================================================
// Snapshots and scoped deltas
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub devices: Vec<DeviceStats>,
    pub parallel_read_time: f64,
    pub parallel_write_time: f64,
    pub parallel_io_time: f64,
    pub wait_time_read: f64,
    pub wait_time_write: f64,
    pub elapsed: f64,
}

impl StatsSnapshot {
    pub fn total_reads(&self) -> u64 {
        self.devices.iter().map(|d| d.reads).sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.devices.iter().map(|d| d.writes).sum()
    }

    pub fn total_read_bytes(&self) -> u64 {
        self.devices.iter().map(|d| d.read_bytes).sum()
    }

    pub fn total_write_bytes(&self) -> u64 {
        self.devices.iter().map(|d| d.write_bytes).sum()
    }

    pub fn wait_time_total(&self) -> f64 {
        self.wait_time_read + self.wait_time_write
    }

    /// Element-wise difference `self - earlier`.
    pub fn delta(&self, earlier: &StatsSnapshot) -> Result<StatsSnapshot> {
        if self.devices.len() != earlier.devices.len() {
            return Err(ExtError::Config(format!(
                "snapshot device count mismatch: {} vs {}",
                self.devices.len(),
                earlier.devices.len()
            )));
        }
        Ok(StatsSnapshot {
            devices: self
                .devices
                .iter()
                .zip(&earlier.devices)
                .map(|(a, b)| DeviceStats {
                    device_id: a.device_id,
                    reads: a.reads - b.reads,
                    writes: a.writes - b.writes,
                    read_bytes: a.read_bytes - b.read_bytes,
                    write_bytes: a.write_bytes - b.write_bytes,
                    read_time_s: a.read_time_s - b.read_time_s,
                    write_time_s: a.write_time_s - b.write_time_s,
                })
                .collect(),
            parallel_read_time: self.parallel_read_time - earlier.parallel_read_time,
            parallel_write_time: self.parallel_write_time - earlier.parallel_write_time,
            parallel_io_time: self.parallel_io_time - earlier.parallel_io_time,
            wait_time_read: self.wait_time_read - earlier.wait_time_read,
            wait_time_write: self.wait_time_write - earlier.wait_time_write,
            elapsed: self.elapsed - earlier.elapsed,
        })
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "I/O statistics ({} device{}, {:.2}s elapsed)",
            self.devices.len(),
            if self.devices.len() == 1 { "" } else { "s" },
            self.elapsed
        )?;
        writeln!(
            f,
            " reads : {:>10} ops {:>12} bytes  parallel {:.3}s",
            self.total_reads(),
            self.total_read_bytes(),
            self.parallel_read_time
        )?;
        writeln!(
            f,
            " writes: {:>10} ops {:>12} bytes  parallel {:.3}s",
            self.total_writes(),
            self.total_write_bytes(),
            self.parallel_write_time
        )?;
        writeln!(f, " parallel I/O time: {:.3}s", self.parallel_io_time)?;
        write!(
            f,
            " wait: {:.3}s total ({:.3}s read, {:.3}s write)",
            self.wait_time_total(),
            self.wait_time_read,
            self.wait_time_write
        )
    }
}

/// Collects the I/O delta between its construction and [`finish`].
///
/// [`finish`]: ScopedStats::finish
pub struct ScopedStats<'a> {
    stats: &'a IoStats,
    begin: StatsSnapshot,
}

impl<'a> ScopedStats<'a> {
    pub fn new(stats: &'a IoStats) -> Self {
        Self {
            begin: stats.snapshot(),
            stats,
        }
    }

    pub fn finish(self) -> StatsSnapshot {
        self.stats
            .snapshot()
            .delta(&self.begin)
            .expect("device count is fixed for the lifetime of IoStats")
    }
}
