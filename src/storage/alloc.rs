//! Allocation strategies.
//!
//! A strategy maps the index of a block within a contiguous allocation batch
//! to the device that should receive it. Higher layers pick striping versus
//! randomized placement without knowing how many devices are configured.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Maps batch index `i` to a device index in `0..num_devices`.
pub trait AllocStrategy: Send + Sync {
    fn device(&self, index: u64, num_devices: usize) -> usize;

    fn name(&self) -> &'static str;
}

/// Round-robin placement: block `i` goes to device `i mod D`.
#[derive(Debug, Default, Clone)]
pub struct Striping;

impl AllocStrategy for Striping {
    #[inline]
    fn device(&self, index: u64, num_devices: usize) -> usize {
        (index % num_devices as u64) as usize
    }

    fn name(&self) -> &'static str {
        "striping"
    }
}

/// A random permutation of the devices, applied cyclically. Spreads load
/// like striping but decorrelates device order across containers.
pub struct RandomCyclic {
    perm: Mutex<Vec<usize>>,
    seeded: Option<u64>,
}

impl RandomCyclic {
    pub fn new() -> Self {
        Self {
            perm: Mutex::new(Vec::new()),
            seeded: None,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            perm: Mutex::new(Vec::new()),
            seeded: Some(seed),
        }
    }

    fn ensure_perm(&self, num_devices: usize) {
        let mut perm = self.perm.lock();
        if perm.len() != num_devices {
            let mut rng = match self.seeded {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_os_rng(),
            };
            *perm = (0..num_devices).collect();
            perm.shuffle(&mut rng);
        }
    }
}

impl Default for RandomCyclic {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocStrategy for RandomCyclic {
    fn device(&self, index: u64, num_devices: usize) -> usize {
        self.ensure_perm(num_devices);
        let perm = self.perm.lock();
        perm[(index % num_devices as u64) as usize]
    }

    fn name(&self) -> &'static str {
        "random_cyclic"
    }
}

/// A random base device plus striding: `(base + i) mod D`.
pub struct SimpleRandom {
    base: u64,
}

impl SimpleRandom {
    pub fn new() -> Self {
        Self {
            base: rand::rng().random(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            base: StdRng::seed_from_u64(seed).random(),
        }
    }
}

impl Default for SimpleRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocStrategy for SimpleRandom {
    #[inline]
    fn device(&self, index: u64, num_devices: usize) -> usize {
        ((self.base + index) % num_devices as u64) as usize
    }

    fn name(&self) -> &'static str {
        "simple_random"
    }
}

/// Every block drawn independently at random.
pub struct FullyRandom {
    rng: Mutex<StdRng>,
}

impl FullyRandom {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for FullyRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocStrategy for FullyRandom {
    fn device(&self, _index: u64, num_devices: usize) -> usize {
        self.rng.lock().random_range(0..num_devices)
    }

    fn name(&self) -> &'static str {
        "fully_random"
    }
}
