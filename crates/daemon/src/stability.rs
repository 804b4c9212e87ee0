//! Stability checking module for verifying files are no longer being written.
//!
//! A newly observed file is sampled at a fixed interval. It is considered
//! fully written once its size has stayed the same, and non-zero, for a
//! configured number of consecutive samples.

use recodex_config::StabilityConfig;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Sampling parameters for a stability wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilityPolicy {
    /// Delay before each size sample.
    pub interval: Duration,
    /// Total number of samples before giving up.
    pub max_samples: u32,
    /// Consecutive unchanged samples needed to declare the file ready.
    pub required_stable: u32,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self::from(&StabilityConfig::default())
    }
}

impl From<&StabilityConfig> for StabilityPolicy {
    fn from(cfg: &StabilityConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.interval_ms),
            max_samples: cfg.max_samples,
            required_stable: cfg.required_stable_samples,
        }
    }
}

/// Outcome of waiting for a file to settle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilityResult {
    /// Size held steady for the required number of samples.
    Ready { size: u64 },
    /// Sampling budget ran out first. Callers treat this as ready.
    TimedOut { last_size: Option<u64> },
}

/// Tracks consecutive unchanged size samples.
///
/// Pure state machine so the sampling rule can be tested without a
/// filesystem.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    previous: u64,
    streak: u32,
    required: u32,
}

impl StabilityTracker {
    pub fn new(required: u32) -> Self {
        Self {
            previous: 0,
            streak: 0,
            required,
        }
    }

    /// Feed one sample; `None` means the file was not there.
    ///
    /// Returns true once the size has repeated `required` times in a row.
    pub fn observe(&mut self, size: Option<u64>) -> bool {
        match size {
            Some(current) if current == self.previous && current > 0 => {
                self.streak += 1;
                self.streak >= self.required
            }
            Some(current) => {
                self.streak = 0;
                self.previous = current;
                false
            }
            None => {
                self.streak = 0;
                self.previous = 0;
                false
            }
        }
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn last_size(&self) -> u64 {
        self.previous
    }
}

/// Wait until `path` stops growing or the sampling budget is exhausted.
///
/// A missing file or a transient read error is retried on the next sample,
/// never surfaced as an error.
pub async fn wait_until_stable(path: &Path, policy: &StabilityPolicy) -> StabilityResult {
    let mut tracker = StabilityTracker::new(policy.required_stable);
    let mut last_size = None;

    for _ in 0..policy.max_samples {
        sleep(policy.interval).await;

        let sample = match tokio::fs::metadata(path).await {
            Ok(metadata) => Some(metadata.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "size sample failed, retrying");
                continue;
            }
        };

        if sample.is_some() {
            last_size = sample;
        }

        if tracker.observe(sample) {
            return StabilityResult::Ready {
                size: tracker.last_size(),
            };
        }
    }

    warn!(
        path = %path.display(),
        samples = policy.max_samples,
        "file did not stabilize within the sampling budget, processing anyway"
    );
    StabilityResult::TimedOut { last_size }
}
