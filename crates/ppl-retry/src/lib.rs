// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-retry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use ppl_core::EngineError;
use ppl_core::config::RetryOptions;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Backoff policy for one logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
    /// Absolute cap on a single sleep.
    pub cap: Duration,
    /// Hard wall-clock deadline for the whole call, attempts included.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&RetryOptions::default())
    }
}

impl RetryPolicy {
    /// Build a policy from the pipeline's declarative retry options.
    pub fn from_options(opts: &RetryOptions) -> Self {
        Self {
            initial_delay: Duration::from_secs_f64(opts.initial_delay_s.max(0.0)),
            multiplier: opts.multiplier.max(1.0),
            jitter: opts.jitter.clamp(0.0, 0.999),
            cap: Duration::from_secs_f64(opts.cap_s.max(0.0)),
            max_elapsed: Duration::from_secs_f64(opts.max_elapsed_s.max(0.0)),
        }
    }

    /// Start building a policy from defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// The capped, un-jittered delay before retry `attempt` (0-based).
    fn base_delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.cap.as_secs_f64()))
    }

    /// Apply the jitter fraction to a base delay.
    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
    }
}

/// Fluent builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set the first backoff delay.
    #[must_use]
    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.policy.initial_delay = d;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn multiplier(mut self, m: f64) -> Self {
        self.policy.multiplier = m.max(1.0);
        self
    }

    /// Set the jitter fraction (clamped to `[0, 1)`).
    #[must_use]
    pub fn jitter(mut self, j: f64) -> Self {
        self.policy.jitter = j.clamp(0.0, 0.999);
        self
    }

    /// Set the absolute per-sleep cap.
    #[must_use]
    pub fn cap(mut self, cap: Duration) -> Self {
        self.policy.cap = cap;
        self
    }

    /// Set the hard wall-clock deadline.
    #[must_use]
    pub fn max_elapsed(mut self, d: Duration) -> Self {
        self.policy.max_elapsed = d;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

// ---------------------------------------------------------------------------
// call
// ---------------------------------------------------------------------------

/// Successful outcome of a retried call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The operation's value.
    pub value: T,
    /// Attempts beyond the first.
    pub retries: u64,
    /// Cumulative backoff sleep.
    pub slept: Duration,
}

/// Run `op`, retrying transient failures under `policy`.
///
/// Counters emitted under `label`: `attempts`, `failures`, `successes`,
/// `sleep_ms`.
///
/// # Errors
///
/// Returns the last transient error's replacement
/// (`EngineError::deadline_exceeded()`) when the deadline expires, or the
/// first non-transient error unchanged.
pub async fn call<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<RetryOutcome<T>, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let registry = ppl_telemetry::global();
    let start = Instant::now();
    let mut attempt: u32 = 0;
    let mut slept = Duration::ZERO;

    loop {
        registry.incr(label, "attempts");
        match op().await {
            Ok(value) => {
                registry.incr(label, "successes");
                return Ok(RetryOutcome {
                    value,
                    retries: attempt as u64,
                    slept,
                });
            }
            Err(err) if err.is_transient() => {
                registry.incr(label, "failures");
                let delay = policy.jittered(policy.base_delay(attempt));
                let elapsed = start.elapsed();
                if elapsed + delay > policy.max_elapsed {
                    warn!(
                        target: "ppl.retry",
                        label,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "retry deadline exceeded"
                    );
                    return Err(EngineError::deadline_exceeded());
                }
                debug!(
                    target: "ppl.retry",
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                slept += delay;
                registry.add(label, "sleep_ms", delay.as_millis() as u64);
                attempt += 1;
            }
            Err(err) => {
                registry.incr(label, "failures");
                return Err(err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
