//! File-backed block devices.
//!
//! Each configured device is one preallocated file served by a dedicated
//! worker thread draining a bounded operation queue. The worker owns the
//! file handle, so no locking happens on the data path; asynchrony towards
//! callers comes entirely from the queue plus [`Request`] handles.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{ExtError, Result};
use crate::io::request::{ReqShared, Request};
use crate::io::stats::{IoStats, WaitKind};
use crate::storage::{Bid, RawBuf};

enum OpKind {
    Read,
    Write,
}

struct Op {
    kind: OpKind,
    offset: u64,
    buf: RawBuf,
    shared: Arc<ReqShared>,
}

// ============================================================================
// Worker
// ============================================================================

fn run_worker(device: u16, mut file: File, rx: Receiver<Op>, stats: Arc<IoStats>) {
    debug!(device, "device worker started");
    for op in rx.iter() {
        let mut buf = op.buf;
        if op.shared.cancel.load(Ordering::Acquire) {
            op.shared.skipped.store(true, Ordering::Release);
            op.shared.complete(Ok(buf));
            continue;
        }
        let begin = Instant::now();
        let result = match op.kind {
            OpKind::Read => {
                stats.read_started();
                let r = file
                    .seek(SeekFrom::Start(op.offset))
                    .and_then(|_| file.read_exact(buf.as_mut_slice()));
                stats.read_finished(device, buf.len() as u64, begin.elapsed());
                r
            }
            OpKind::Write => {
                stats.write_started();
                let r = file
                    .seek(SeekFrom::Start(op.offset))
                    .and_then(|_| file.write_all(buf.as_slice()));
                stats.write_finished(device, buf.len() as u64, begin.elapsed());
                r
            }
        };
        match result {
            Ok(()) => op.shared.complete(Ok(buf)),
            Err(e) => {
                error!(device, offset = op.offset, %e, "device IO failed");
                op.shared.complete(Err(ExtError::DeviceIo {
                    device,
                    offset: op.offset,
                    source: e,
                }));
            }
        }
    }
    debug!(device, "device worker stopped");
}

// ============================================================================
// DiskManager
// ============================================================================

struct DeviceHandle {
    tx: Sender<Op>,
    worker: JoinHandle<()>,
    path: PathBuf,
}

/// Owns the device files and their worker threads.
pub struct DiskManager {
    devices: Mutex<Option<Vec<DeviceHandle>>>,
    stats: Arc<IoStats>,
}

impl DiskManager {
    /// Creates (or truncates) one file per device under `dir`, preallocated
    /// to the configured size, and spawns the workers.
    pub fn new(
        dir: &Path,
        device_bytes: &[u64],
        queue_depth: usize,
        stats: Arc<IoStats>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut devices = Vec::with_capacity(device_bytes.len());
        for (i, &bytes) in device_bytes.iter().enumerate() {
            let path = dir.join(format!("dev{i}.dat"));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.set_len(bytes)?;
            let (tx, rx) = bounded(queue_depth.max(1));
            let worker_stats = Arc::clone(&stats);
            let worker = std::thread::Builder::new()
                .name(format!("extmem-dev{i}"))
                .spawn(move || run_worker(i as u16, file, rx, worker_stats))?;
            devices.push(DeviceHandle { tx, worker, path });
        }
        Ok(Self {
            devices: Mutex::new(Some(devices)),
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    fn submit(&self, kind: OpKind, bid: Bid, buf: RawBuf) -> Request {
        let wait_kind = match kind {
            OpKind::Read => WaitKind::Read,
            OpKind::Write => WaitKind::Write,
        };
        debug_assert!(bid.valid(), "IO on invalid bid");
        let guard = self.devices.lock();
        let devices = match guard.as_ref() {
            Some(d) => d,
            None => return Request::failed(ExtError::ShutDown, wait_kind, Arc::clone(&self.stats)),
        };
        let shared = ReqShared::new();
        let op = Op {
            kind,
            offset: bid.offset,
            buf,
            shared: Arc::clone(&shared),
        };
        // A full queue applies backpressure to the submitter.
        if devices[bid.device as usize].tx.send(op).is_err() {
            return Request::failed(ExtError::ShutDown, wait_kind, Arc::clone(&self.stats));
        }
        Request::new(shared, wait_kind, Arc::clone(&self.stats))
    }

    /// Asynchronously read the block at `bid` into `buf`.
    pub fn read(&self, bid: Bid, buf: RawBuf) -> Request {
        self.submit(OpKind::Read, bid, buf)
    }

    /// Asynchronously write `buf` to the block at `bid`.
    pub fn write(&self, bid: Bid, buf: RawBuf) -> Request {
        self.submit(OpKind::Write, bid, buf)
    }

    pub fn read_sync(&self, bid: Bid, buf: RawBuf) -> Result<RawBuf> {
        self.read(bid, buf).wait()
    }

    pub fn write_sync(&self, bid: Bid, buf: RawBuf) -> Result<RawBuf> {
        self.write(bid, buf).wait()
    }

    /// Drains the queues, joins the workers and removes the device files.
    /// Idempotent; outstanding requests complete before the workers exit.
    pub fn shutdown(&self) {
        let handles = self.devices.lock().take();
        if let Some(handles) = handles {
            for h in handles {
                drop(h.tx);
                if h.worker.join().is_err() {
                    error!(path = %h.path.display(), "device worker panicked");
                }
                let _ = std::fs::remove_file(&h.path);
            }
        }
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
