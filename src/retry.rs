//! Retry/Backoff
//!
//! [`Attempt`] runs one executor call for a unit under its hard deadline and classifies the
//! outcome: success, retry after a backoff delay, or terminal failure. Backoff grows as
//! `base_delay * 2^attempt_count`, capped at `max_delay`, plus jitter of up to
//! `jitter_ratio` of the capped delay.

use crate::config::EngineConfig;
use crate::error::UnitError;
use crate::executor::{Deadline, ExecutorTable};
use crate::job::{Unit, UnitArtifact};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// Uniform sample in [0, 1) taken from the random node bits of a v4 UUID.
pub fn random_unit_interval() -> f64 {
    const BITS: u32 = 48;
    let raw = Uuid::new_v4().as_u128() & ((1u128 << BITS) - 1);
    raw as f64 / (1u64 << BITS) as f64
}

/// Source of the random part of a backoff delay.
pub trait JitterSource: Send + Sync {
    /// A duration in `[0, max]`.
    fn sample(&self, max: Duration) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self, max: Duration) -> Duration {
        max.mul_f64(random_unit_interval())
    }
}

/// Deterministic delays, for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn sample(&self, _max: Duration) -> Duration {
        Duration::ZERO
    }
}

#[derive(Clone)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
    jitter: Arc<dyn JitterSource>,
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter_ratio", &self.jitter_ratio)
            .finish()
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_ratio: f64) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.backoff_base_delay(),
            config.backoff_max_delay(),
            config.backoff_jitter_ratio,
        )
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Exponential part of the delay, before jitter.
    pub fn base_delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before the next attempt once `attempt_count` attempts have run.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let delay = self.base_delay_for(attempt_count);
        delay + self.jitter.sample(delay.mul_f64(self.jitter_ratio))
    }

    pub fn max_total_delay(&self) -> Duration {
        self.max_delay + self.max_delay.mul_f64(self.jitter_ratio)
    }
}

/// Classified result of one attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded(UnitArtifact),
    /// Retryable failure with attempts left
    Retry { error: UnitError, delay: Duration },
    /// Fatal failure, or retryable with attempts exhausted
    Failed(UnitError),
}

impl AttemptOutcome {
    /// No further attempts follow.
    pub fn is_done(&self) -> bool {
        !matches!(self, AttemptOutcome::Retry { .. })
    }
}

/// One attempt of a unit against its executor, with the retry policy visible at the call site.
pub struct Attempt<'a> {
    executors: &'a ExecutorTable,
    backoff: &'a BackoffPolicy,
}

impl<'a> Attempt<'a> {
    pub fn new(executors: &'a ExecutorTable, backoff: &'a BackoffPolicy) -> Self {
        Self { executors, backoff }
    }

    /// Run the attempt `unit.attempt_count` under the unit's time budget.
    pub async fn run(&self, unit: &Unit) -> AttemptOutcome {
        let budget = unit.time_budget();
        let deadline = Deadline::after(budget);
        let result = match timeout(budget, self.executors.execute(unit, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(UnitError::timeout(budget.as_millis())),
        };
        self.classify(unit, result)
    }

    pub fn classify(&self, unit: &Unit, result: Result<UnitArtifact, UnitError>) -> AttemptOutcome {
        match result {
            Ok(artifact) => AttemptOutcome::Succeeded(artifact),
            Err(error) if error.is_retryable() && unit.attempts_remaining() => AttemptOutcome::Retry {
                delay: self.backoff.delay_for(unit.attempt_count),
                error,
            },
            Err(error) => AttemptOutcome::Failed(error),
        }
    }
}
