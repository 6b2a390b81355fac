//! Simulation algorithm: performs no I/O and attaches no real buffers;
//! records the operation trace for a later offline-LFD pass.

use crate::error::{ExtError, Result};
use crate::scheduler::{Algorithm, Core, PredictionElement, PredictionSequence, SbId, SchedulerOp};
use crate::storage::{Bid, Pod};

pub struct Simulation {
    sequence: PredictionSequence,
    time: u64,
    last_op_release: bool,
    /// Reference counts, tracked here because no buffers are attached.
    acquired: Vec<u32>,
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            sequence: Vec::new(),
            time: 0,
            last_op_release: false,
            acquired: Vec::new(),
        }
    }

    fn record(&mut self, op: SchedulerOp, id: SbId) {
        // A fresh acquire after a release starts a new logical timestep, so
        // the offline pass can tell overlapping scopes apart.
        if matches!(op, SchedulerOp::Acquire) && self.last_op_release {
            self.time += 1;
        }
        self.last_op_release = matches!(op, SchedulerOp::Release | SchedulerOp::ReleaseDirty);
        self.sequence.push(PredictionElement {
            op,
            id,
            time: self.time,
        });
    }

    fn count(&mut self, id: SbId) -> &mut u32 {
        if self.acquired.len() <= id {
            self.acquired.resize(id + 1, 0);
        }
        &mut self.acquired[id]
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Pod> Algorithm<V> for Simulation {
    fn acquire(&mut self, _core: &mut Core<V>, id: SbId) -> Result<()> {
        self.record(SchedulerOp::Acquire, id);
        *self.count(id) += 1;
        Ok(())
    }

    fn release(&mut self, _core: &mut Core<V>, id: SbId, dirty: bool) -> Result<()> {
        if *self.count(id) == 0 {
            return Err(ExtError::PreconditionViolation(
                "release of a non-acquired block".into(),
            ));
        }
        *self.count(id) -= 1;
        self.record(
            if dirty {
                SchedulerOp::ReleaseDirty
            } else {
                SchedulerOp::Release
            },
            id,
        );
        Ok(())
    }

    fn deinitialize(&mut self, _core: &mut Core<V>, id: SbId) -> Result<()> {
        if *self.count(id) > 0 {
            return Err(ExtError::PreconditionViolation(
                "deinitialize of an acquired block".into(),
            ));
        }
        self.record(SchedulerOp::Deinitialize, id);
        Ok(())
    }

    fn initialize(&mut self, _core: &mut Core<V>, id: SbId, _bid: Bid) -> Result<()> {
        self.record(SchedulerOp::Initialize, id);
        Ok(())
    }

    fn extract_external(&mut self, _core: &mut Core<V>, id: SbId) -> Result<Bid> {
        self.record(SchedulerOp::ExtractExternal, id);
        Ok(Bid::INVALID)
    }

    fn explicit_timestep(&mut self) {
        self.time += 1;
        self.last_op_release = false;
    }

    fn evictable(&self) -> Vec<SbId> {
        Vec::new()
    }

    fn adopt_evictable(&mut self, _ids: Vec<SbId>) {}

    fn is_simulating(&self) -> bool {
        true
    }

    fn prediction_sequence(&self) -> Option<&PredictionSequence> {
        Some(&self.sequence)
    }
}
