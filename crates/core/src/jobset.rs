// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Accounting scope `(project, name)` (§3 "Jobset").

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Key identifying a jobset: `(project, name)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobsetKey {
    pub project: String,
    pub name: String,
}

impl JobsetKey {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for JobsetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.project, self.name)
    }
}

/// Backwards-compatible alias matching spec.md's naming of the entity.
pub type JobsetName = JobsetKey;

const ROLLING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Tracks a rolling 24-hour record of `(stepStartTime, stepDuration)` pairs
/// to compute `sharesUsed = totalSeconds / shares` (§3 "Jobset").
#[derive(Debug)]
pub struct Jobset {
    pub key: JobsetKey,
    pub shares: u32,
    samples: VecDeque<(Instant, Duration)>,
    total: Duration,
}

impl Jobset {
    pub fn new(key: JobsetKey, shares: u32) -> Self {
        Self {
            key,
            shares: shares.max(1),
            samples: VecDeque::new(),
            total: Duration::ZERO,
        }
    }

    /// Record that a step attributed to this jobset ran for `duration`,
    /// starting at `start`. Evicts samples older than the rolling window.
    pub fn record_step(&mut self, start: Instant, duration: Duration, now: Instant) {
        self.samples.push_back((start, duration));
        self.total += duration;
        self.evict_stale(now);
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some((start, dur)) = self.samples.front().copied() {
            if now.saturating_duration_since(start) > ROLLING_WINDOW {
                self.samples.pop_front();
                self.total = self.total.saturating_sub(dur);
            } else {
                break;
            }
        }
    }

    /// `sharesUsed = totalSeconds / shares`, recomputed against `now` so
    /// stale samples outside the rolling window don't count.
    pub fn shares_used(&mut self, now: Instant) -> f64 {
        self.evict_stale(now);
        self.total.as_secs_f64() / self.shares as f64
    }
}

#[cfg(test)]
#[path = "jobset_tests.rs"]
mod tests;
