// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A single derivation to be built (§3 "Step").
//!
//! `Step` nodes form the Step Graph (§4.2): `deps` edges are strong
//! (`Arc`), `rdeps`/`builds` edges are weak (`Weak`) by construction,
//! matching the reference-counting discipline in §9 "Design notes" — a
//! language with native weak references (Rust) is used directly instead of
//! the arena-with-id fallback the notes suggest for languages without one.

use crate::build::Build;
use crate::ids::{BuildId, DrvPath};
use crate::jobset::JobsetKey;
use crate::BasicDerivation;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Where a `Step` sits in its lifecycle (§3 "Invariants": "A Step is in at
/// most one of {unreached, runnable, active, done}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Not yet determined to be runnable (deps still outstanding, or not
    /// yet `created`).
    Unreached,
    /// `deps` is empty and `created == true`; sitting in the dispatcher's
    /// runnable list.
    Runnable,
    /// Currently assigned to a Builder Worker.
    Active,
    /// Finished (successfully, as a cached substitution, or terminally
    /// failed) and no longer part of the live graph.
    Done,
}

/// Mutable per-step bookkeeping, guarded by a single mutex per §5 ("Per-Step
/// state mutex: held only for short inspection/mutation; never held across
/// I/O").
#[derive(Debug, Default)]
pub struct StepState {
    /// True once every input derivation has been recursively visited and
    /// attached as a dep (§4.1 step 5).
    pub created: bool,
    /// Strong references to steps this step depends on.
    pub deps: HashSet<DrvPath>,
    /// Weak references (by drv path) to steps that depend on this one.
    pub rdeps: Vec<Weak<Step>>,
    /// Weak references to builds for which this step is the top-level step.
    pub builds: Vec<Weak<Build>>,
    /// Jobsets this step's wall time is accounted to.
    pub jobsets: HashSet<JobsetKey>,
    pub tries: u32,
    pub after: Option<Instant>,
    pub highest_global_priority: i64,
    pub highest_local_priority: i64,
    pub lowest_build_id: Option<BuildId>,
    pub status: StepStatus,
    /// Assigned once, the first time the step is created (`BuildSteps.stepnr`
    /// for every build that ever references it, §6).
    pub stepnr: Option<i32>,
    /// Set the moment the step first becomes runnable; used to detect a
    /// step that no machine has ever matched (§6 "max_unsupported_time").
    pub runnable_since: Option<Instant>,
    /// Set by `processQueueChange` when the step's worker should stop at
    /// the next opportunity (§4.4, §5 "Cancellation"). Cooperative: the
    /// worker observes this after the build protocol returns, not
    /// mid-transfer.
    pub cancelled: bool,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Unreached
    }
}

impl StepState {
    /// §3 "A Step with empty `deps` and `created==true` is *runnable*."
    pub fn is_runnable(&self) -> bool {
        self.created && self.deps.is_empty()
    }

    /// Monotone-under-max priority propagation (§3 "Invariants", §8
    /// property 5).
    pub fn bump_priorities(&mut self, global: i64, local: i64, build_id: BuildId) {
        self.highest_global_priority = self.highest_global_priority.max(global);
        self.highest_local_priority = self.highest_local_priority.max(local);
        self.lowest_build_id = Some(match self.lowest_build_id {
            Some(existing) => existing.min(build_id),
            None => build_id,
        });
    }

    /// Drop dead weak rdep/build references. Called opportunistically by
    /// scans that walk these lists (§4.2 "crossing them is a lookup
    /// operation that may observe a gone step").
    pub fn prune_dead(&mut self) {
        self.rdeps.retain(|w| w.strong_count() > 0);
        self.builds.retain(|w| w.strong_count() > 0);
    }

    pub fn live_rdeps(&self) -> impl Iterator<Item = Arc<Step>> + '_ {
        self.rdeps.iter().filter_map(|w| w.upgrade())
    }

    pub fn live_builds(&self) -> impl Iterator<Item = Arc<Build>> + '_ {
        self.builds.iter().filter_map(|w| w.upgrade())
    }
}

/// A single derivation to be built.
#[derive(Debug)]
pub struct Step {
    pub drv_path: DrvPath,
    pub derivation: BasicDerivation,
    /// `system` + required features, concatenated (§3).
    pub platform: String,
    pub prefer_local: bool,
    pub is_deterministic: bool,
    pub state: Mutex<StepState>,
}

impl Step {
    pub fn new(drv_path: DrvPath, derivation: BasicDerivation) -> Self {
        let platform = derivation.platform_string();
        Self {
            drv_path,
            prefer_local: derivation.prefer_local_build,
            is_deterministic: derivation.is_deterministic,
            platform,
            derivation,
            state: Mutex::new(StepState::default()),
        }
    }

    /// Required features for dispatch matching, including the synthetic
    /// `"local"` feature when `preferLocalBuild` is set (§4.3 step 4).
    pub fn required_features(&self) -> HashSet<String> {
        let mut feats = self.derivation.required_features.clone();
        if self.prefer_local {
            feats.insert("local".to_string());
        }
        feats
    }
}

#[cfg(test)]
#[path = "step_tests.rs"]
mod tests;
