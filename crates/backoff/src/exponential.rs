use quorum_types::{QuorumError, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::BackoffPolicy;

/// Increment, by default, in powers of two.
pub const DEFAULT_EXPONENT_BASE: u64 = 2;

/// Backs off exponentially with every call, capped at `max_delay_ms`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    exponent_base: u64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Result<Self> {
        Self::with_base(initial_delay_ms, max_delay_ms, DEFAULT_EXPONENT_BASE)
    }

    /// A base of 1 yields a constant delay. A base of 0 is rejected since the
    /// series would collapse to zero after the first call.
    pub fn with_base(initial_delay_ms: u64, max_delay_ms: u64, exponent_base: u64) -> Result<Self> {
        if exponent_base == 0 {
            return Err(QuorumError::BackoffConfiguration(
                "exponent base must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            initial_delay_ms,
            max_delay_ms,
            exponent_base,
            attempt: 0,
        })
    }

    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn exponent_base(&self) -> u64 {
        self.exponent_base
    }

    /// Number of values produced since construction or the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Value of the series at `attempt`, saturating at `max_delay_ms` on overflow.
    fn delay_at(&self, attempt: u32) -> u64 {
        if self.initial_delay_ms == 0 {
            return 0;
        }

        self.exponent_base
            .checked_pow(attempt)
            .and_then(|factor| factor.checked_mul(self.initial_delay_ms))
            .map_or(self.max_delay_ms, |delay| delay.min(self.max_delay_ms))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_wait_ms(&mut self) -> u64 {
        let delay = self.delay_at(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Exponential backoff multiplied by a uniform random factor in `[0, 1)`.
///
/// The factor is applied to the exponential value before truncating to whole
/// milliseconds, so small delays keep their jitter. Zero is a legitimate output.
pub struct JitteredExponentialBackoff<R = StdRng> {
    inner: ExponentialBackoff,
    rng: R,
}

impl JitteredExponentialBackoff<StdRng> {
    /// Jittered backoff with the default base and an entropy-seeded generator.
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Result<Self> {
        Self::with_rng(
            initial_delay_ms,
            max_delay_ms,
            DEFAULT_EXPONENT_BASE,
            StdRng::from_entropy(),
        )
    }
}

impl<R: RngCore> JitteredExponentialBackoff<R> {
    pub fn with_rng(
        initial_delay_ms: u64,
        max_delay_ms: u64,
        exponent_base: u64,
        rng: R,
    ) -> Result<Self> {
        Ok(Self {
            inner: ExponentialBackoff::with_base(initial_delay_ms, max_delay_ms, exponent_base)?,
            rng,
        })
    }

    pub fn attempt(&self) -> u32 {
        self.inner.attempt()
    }
}

impl<R: RngCore + Send> BackoffPolicy for JitteredExponentialBackoff<R> {
    fn next_wait_ms(&mut self) -> u64 {
        let ceiling = self.inner.next_wait_ms();
        let factor: f64 = self.rng.gen();
        // f64 cannot represent every u64; clamp so rounding never exceeds the ceiling
        ((factor * ceiling as f64).floor() as u64).min(ceiling)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

impl<R> std::fmt::Debug for JitteredExponentialBackoff<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitteredExponentialBackoff")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
