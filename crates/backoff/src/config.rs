use quorum_types::{QuorumError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::{
    BackoffPolicy, ExponentialBackoff, JitteredExponentialBackoff, RandomBackoff,
    DEFAULT_EXPONENT_BASE, DEFAULT_RANDOM_BOUND_MS,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Exponential,
    #[default]
    Jittered,
    Random,
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffStrategy::Exponential => write!(f, "exponential"),
            BackoffStrategy::Jittered => write!(f, "jittered"),
            BackoffStrategy::Random => write!(f, "random"),
        }
    }
}

impl BackoffStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Some(BackoffStrategy::Exponential),
            "jittered" => Some(BackoffStrategy::Jittered),
            "random" => Some(BackoffStrategy::Random),
            _ => None,
        }
    }
}

/// Backoff settings as they arrive from configuration.
///
/// Fields are signed so that negative values coming from a config file or the
/// environment are reported as configuration errors instead of being wrapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: i64,
    pub max_delay_ms: i64,
    pub exponent_base: i64,
    pub upper_bound_ms: i64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Jittered,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            exponent_base: DEFAULT_EXPONENT_BASE as i64,
            upper_bound_ms: DEFAULT_RANDOM_BOUND_MS as i64,
        }
    }
}

impl BackoffConfig {
    /// Check every field the selected strategy uses.
    pub fn validate(&self) -> Result<()> {
        match self.strategy {
            BackoffStrategy::Exponential | BackoffStrategy::Jittered => {
                non_negative("initial_delay_ms", self.initial_delay_ms)?;
                non_negative("max_delay_ms", self.max_delay_ms)?;
                if non_negative("exponent_base", self.exponent_base)? == 0 {
                    return Err(QuorumError::BackoffConfiguration(
                        "exponent_base must be at least 1".to_string(),
                    ));
                }
            }
            BackoffStrategy::Random => {
                if non_negative("upper_bound_ms", self.upper_bound_ms)? == 0 {
                    return Err(QuorumError::BackoffConfiguration(
                        "upper_bound_ms must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build a fresh policy. Each reconnection loop must get its own instance.
    pub fn build(&self) -> Result<Box<dyn BackoffPolicy>> {
        self.validate()?;
        debug!("Building {} backoff policy: {:?}", self.strategy, self);

        let policy: Box<dyn BackoffPolicy> = match self.strategy {
            BackoffStrategy::Exponential => Box::new(ExponentialBackoff::with_base(
                self.initial_delay_ms as u64,
                self.max_delay_ms as u64,
                self.exponent_base as u64,
            )?),
            BackoffStrategy::Jittered => Box::new(JitteredExponentialBackoff::with_rng(
                self.initial_delay_ms as u64,
                self.max_delay_ms as u64,
                self.exponent_base as u64,
                StdRng::from_entropy(),
            )?),
            BackoffStrategy::Random => Box::new(RandomBackoff::new(self.upper_bound_ms as u64)?),
        };

        Ok(policy)
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        QuorumError::BackoffConfiguration(format!("{} must not be negative, got {}", field, value))
    })
}
