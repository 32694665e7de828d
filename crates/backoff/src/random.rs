use quorum_types::{QuorumError, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::BackoffPolicy;

/// Upper bound used when none is configured.
pub const DEFAULT_RANDOM_BOUND_MS: u64 = 1;

/// Wait times drawn uniformly from `[0, bound)` with no sequential state.
pub struct RandomBackoff<R = StdRng> {
    bound_ms: u64,
    rng: R,
}

impl RandomBackoff<StdRng> {
    pub fn new(bound_ms: u64) -> Result<Self> {
        Self::with_rng(bound_ms, StdRng::from_entropy())
    }
}

impl<R: RngCore> RandomBackoff<R> {
    pub fn with_rng(bound_ms: u64, rng: R) -> Result<Self> {
        if bound_ms == 0 {
            return Err(QuorumError::BackoffConfiguration(
                "random backoff bound must be positive".to_string(),
            ));
        }
        Ok(Self { bound_ms, rng })
    }

    pub fn bound_ms(&self) -> u64 {
        self.bound_ms
    }
}

impl<R: RngCore + Send> BackoffPolicy for RandomBackoff<R> {
    fn next_wait_ms(&mut self) -> u64 {
        self.rng.gen_range(0..self.bound_ms)
    }

    fn reset(&mut self) {}
}

impl<R> std::fmt::Debug for RandomBackoff<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomBackoff")
            .field("bound_ms", &self.bound_ms)
            .finish_non_exhaustive()
    }
}
