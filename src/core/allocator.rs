//! Port allocation
//!
//! Picks a free public port out of the configured inclusive range. Ports are
//! sampled with a CSPRNG so allocations are not trivially predictable, with a
//! sequential scan as the fallback when sampling keeps colliding.
//!
//! The allocator does not reserve anything itself: the credential row that
//! records the port is the reservation, so `allocate` must run inside the same
//! state critical section as the insert that follows it.

use rand::rngs::OsRng;
use rand::Rng;
use std::collections::HashSet;

use crate::error::{AppError, Result};

const MAX_RANDOM_TRIALS: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

impl PortAllocator {
    /// Inclusive range `[start, end]`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn range_size(&self) -> usize {
        if self.end < self.start {
            return 0;
        }
        (self.end - self.start) as usize + 1
    }

    /// Pick a port not present in `held`. Fails with `PoolExhausted` when
    /// every port in the range is taken.
    pub fn allocate(&self, held: &HashSet<u16>) -> Result<u16> {
        let size = self.range_size();
        let held_in_range = held
            .iter()
            .filter(|p| **p >= self.start && **p <= self.end)
            .count();
        if size == 0 || held_in_range >= size {
            return Err(AppError::PoolExhausted);
        }

        let trials = size.min(MAX_RANDOM_TRIALS);
        for _ in 0..trials {
            let port = OsRng.gen_range(self.start..=self.end);
            if !held.contains(&port) {
                return Ok(port);
            }
        }

        // Sampling kept colliding, fall back to a scan.
        for port in self.start..=self.end {
            if !held.contains(&port) {
                return Ok(port);
            }
        }

        Err(AppError::PoolExhausted)
    }

    pub fn is_allocated(&self, port: u16, held: &HashSet<u16>) -> bool {
        held.contains(&port)
    }
}
