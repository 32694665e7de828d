//! Reconnection backoff policies for quorum peers.
//!
//! A peer that loses its connection to another member of the quorum asks a
//! [`BackoffPolicy`] how long to wait before the next attempt. Three policies are
//! provided:
//!
//! - [`ExponentialBackoff`]: `min(max, initial * base^attempt)`
//! - [`JitteredExponentialBackoff`]: the exponential value scaled by a uniform
//!   random factor in `[0, 1)`
//! - [`RandomBackoff`]: a uniform value in `[0, bound)`
//!
//! Jitter and randomness keep the members of a quorum from retrying in lockstep
//! after a correlated failure such as a healed partition.
//!
//! Policies are stateful and owned by exactly one reconnection loop; every method
//! takes `&mut self`.
//!
//! # Example
//! ```
//! use quorum_backoff::{BackoffPolicy, ExponentialBackoff};
//!
//! let mut policy = ExponentialBackoff::new(1, 10).unwrap();
//! assert_eq!(policy.next_wait_ms(), 1);
//! assert_eq!(policy.next_wait_ms(), 2);
//! policy.reset();
//! assert_eq!(policy.next_wait_ms(), 1);
//! ```

mod config;
mod exponential;
mod random;

use std::time::Duration;

pub use config::{BackoffConfig, BackoffStrategy};
pub use exponential::{ExponentialBackoff, JitteredExponentialBackoff, DEFAULT_EXPONENT_BASE};
pub use random::{RandomBackoff, DEFAULT_RANDOM_BOUND_MS};

/// Generates successive wait times, in milliseconds, between retry attempts.
pub trait BackoffPolicy: Send {
    /// The time the caller should wait before its next attempt.
    fn next_wait_ms(&mut self) -> u64;

    /// Restart the series, if the policy has one.
    fn reset(&mut self);

    fn next_wait(&mut self) -> Duration {
        Duration::from_millis(self.next_wait_ms())
    }
}

impl<P: BackoffPolicy + ?Sized> BackoffPolicy for Box<P> {
    fn next_wait_ms(&mut self) -> u64 {
        (**self).next_wait_ms()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
