// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A single requested build of a top-level derivation (§3 "Build").

use crate::ids::{BuildId, DrvPath};
use crate::jobset::JobsetKey;
use crate::step::Step;
use std::sync::{Arc, Weak};

/// A requested build of a top-level derivation, tracked from queueing
/// through to a terminal [`crate::BuildStatus`].
///
/// `top_level_step` is a weak reference: the Step Graph (§4.2) owns the
/// strong reference chain, so a `Build` outliving its step (e.g. while the
/// finishing transaction is in flight) observes `None` rather than keeping
/// an otherwise-dead step alive.
#[derive(Debug)]
pub struct Build {
    pub id: BuildId,
    pub drv_path: DrvPath,
    pub project: String,
    pub jobset: JobsetKey,
    pub job: String,
    pub timestamp: u64,
    pub local_priority: i64,
    pub global_priority: i64,
    pub max_silent_time: u64,
    pub build_timeout: u64,
    top_level_step: Weak<Step>,
    /// Set once the finishing transaction that writes this build's terminal
    /// status has committed, so a crash-recovery scan doesn't redo it
    /// (§4.3 "finishBuild must not run twice for the same build").
    pub finished_in_db: bool,
}

impl Build {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: BuildId,
        drv_path: DrvPath,
        project: impl Into<String>,
        jobset: JobsetKey,
        job: impl Into<String>,
        timestamp: u64,
        local_priority: i64,
        global_priority: i64,
        max_silent_time: u64,
        build_timeout: u64,
        top_level_step: &Arc<Step>,
    ) -> Self {
        Self {
            id,
            drv_path,
            project: project.into(),
            jobset,
            job: job.into(),
            timestamp,
            local_priority,
            global_priority,
            max_silent_time,
            build_timeout,
            top_level_step: Arc::downgrade(top_level_step),
            finished_in_db: false,
        }
    }

    /// The build's top-level step, if the Step Graph still holds it alive.
    pub fn top_level_step(&self) -> Option<Arc<Step>> {
        self.top_level_step.upgrade()
    }
}

#[cfg(test)]
#[path = "build_tests.rs"]
mod tests;
