// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A remote builder machine (§3 "Machine").

use crate::clock::Clock;
use crate::ids::MachineName;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Instant;

/// Connection/back-off bookkeeping for a [`Machine`], carried across
/// machines-file reloads by name (§3 "Lifecycles and ownership").
#[derive(Debug, Default)]
pub struct ConnectState {
    pub current_jobs: u32,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub disabled_until: Option<Instant>,
}

impl ConnectState {
    pub fn is_disabled(&self, now: Instant) -> bool {
        matches!(self.disabled_until, Some(until) if until > now)
    }

    pub fn has_free_slot(&self, max_jobs: u32) -> bool {
        self.current_jobs < max_jobs
    }

    /// Applies the back-off formula from §4.4: `retryInterval *
    /// retryBackoff^(consecutiveFailures-1) + rand(0..jitter)`, capping the
    /// exponent input at 4 consecutive failures. Failures within 30s of the
    /// previous one don't bump the counter again, to avoid triple-counting
    /// parallel aborts against the same machine.
    pub fn record_failure(
        &mut self,
        now: Instant,
        retry_interval_secs: u64,
        retry_backoff: f64,
        jitter_secs: u64,
        jitter: u64,
    ) {
        let double_count = matches!(
            self.last_failure,
            Some(last) if now.saturating_duration_since(last).as_secs() < 30
        );
        if !double_count {
            self.consecutive_failures = (self.consecutive_failures + 1).min(4);
        }
        self.last_failure = Some(now);
        let backoff = retry_interval_secs as f64
            * retry_backoff.powi(self.consecutive_failures.saturating_sub(1) as i32);
        let jitter = if jitter_secs == 0 { 0 } else { jitter % jitter_secs };
        self.disabled_until = Some(now + std::time::Duration::from_secs(backoff as u64 + jitter));
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.disabled_until = None;
    }
}

/// A remote builder, as parsed from one line of the machines file (§6
/// "Machines file").
#[derive(Debug)]
pub struct Machine {
    pub name: MachineName,
    pub ssh_key: Option<String>,
    pub public_host_key: Option<String>,
    pub system_types: HashSet<String>,
    pub supported_features: HashSet<String>,
    pub mandatory_features: HashSet<String>,
    pub max_jobs: u32,
    pub speed_factor: f64,
    pub enabled: bool,
    pub state: Mutex<ConnectState>,
    /// Serializes the handshake+`cmdBuildDerivation` exchange per machine
    /// (§5 "Per-Machine sendLock ... a timed_mutex with 600s timeout"), so
    /// two concurrently dispatched attempts on the same machine never
    /// interleave their wire-protocol bytes.
    pub send_lock: tokio::sync::Mutex<()>,
}

impl Machine {
    pub fn new(name: MachineName, system_types: HashSet<String>, max_jobs: u32, speed_factor: f64) -> Self {
        Self {
            name,
            ssh_key: None,
            public_host_key: None,
            system_types,
            supported_features: HashSet::new(),
            mandatory_features: HashSet::new(),
            max_jobs,
            speed_factor,
            enabled: true,
            state: Mutex::new(ConnectState::default()),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// `systemTypes ∋ step.platform`; `mandatoryFeatures ⊆ stepFeatures`;
    /// `stepFeatures ⊆ supportedFeatures` (§4.3 step 4).
    pub fn supports_step(&self, system: &str, step_features: &HashSet<String>) -> bool {
        self.enabled
            && self.system_types.contains(system)
            && self.mandatory_features.is_subset(step_features)
            && step_features.is_subset(&self.supported_features)
    }

    /// The dispatcher's sort key numerator: `round(currentJobs /
    /// speedFactor)` (§4.3 step 3).
    pub fn dispatch_round(&self) -> i64 {
        let jobs = self.state.lock().current_jobs as f64;
        (jobs / self.speed_factor).round() as i64
    }

    pub fn is_available(&self, clock: &impl Clock) -> bool {
        let now = clock.now();
        let state = self.state.lock();
        self.enabled && !state.is_disabled(now) && state.has_free_slot(self.max_jobs)
    }
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
