// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The in-memory Step Graph (§4.2) and `createStep` (§4.1 step 2-5).
//!
//! The steps map is the weak root of the graph: a `Step` stays reachable
//! only while at least one `Build` or in-flight worker references it
//! (§3 "Invariants", §9 "Cyclic references"). `createStep` recurses into a
//! derivation's inputs, so it is written with manual future-boxing rather
//! than `async fn` (which cannot recurse directly).

use parking_lot::Mutex;
use qr_adapters::{ContentStore, DerivationStore};
use qr_core::{Build, BuildId, DrvPath, Jobset, JobsetKey, Step, StepStatus, StorePath};
use qr_storage::{records::BuildStepRow, Database};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::error::EngineError;

/// Everything `create_step` needs from the outside world, bundled so the
/// recursive call doesn't grow an unwieldy argument list.
pub struct CreateStepCtx<'a> {
    pub database: &'a dyn Database,
    pub derivation_store: &'a dyn DerivationStore,
    pub local_store: &'a dyn ContentStore,
    pub destination_store: &'a dyn ContentStore,
    /// Per-build step-number sequence for `BuildSteps.stepnr` (§6).
    pub stepnr: &'a AtomicI32,
    pub build_id: BuildId,
    /// Where substitution-path imports plant their GC roots (§6
    /// "gc_roots_dir"), matching `builder_worker::import_one`'s own root.
    pub gc_roots_dir: &'a Path,
}

/// What `create_step` resolved a derivation path to (§4.1 step 2-5).
#[derive(Debug)]
pub enum CreateStepOutcome {
    /// A live step the caller should attach as a dep/top-level reference.
    Step(Arc<Step>),
    /// Every output was already valid or substitutable; no Step entered
    /// the graph (§4.1 step 4: "the step is finished-cached").
    CachedDone,
    /// An output path for this derivation (or one of its transitive deps)
    /// is in `FailedPaths` (§4.1 step 2, §7 `bsCachedFailure`).
    PreviousFailure,
}

/// In-memory DAG of build steps, reference-counted by referring builds
/// (§2, §4.2).
#[derive(Default)]
pub struct StepGraph {
    builds: Mutex<HashMap<BuildId, Arc<Build>>>,
    steps: Mutex<HashMap<DrvPath, Weak<Step>>>,
    runnable: Mutex<Vec<Weak<Step>>>,
    jobsets: Mutex<HashMap<JobsetKey, Jobset>>,
    cached_done: Mutex<HashSet<DrvPath>>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_step(&self, drv_path: &DrvPath) -> Option<Arc<Step>> {
        self.steps.lock().get(drv_path).and_then(Weak::upgrade)
    }

    pub fn get_build(&self, id: BuildId) -> Option<Arc<Build>> {
        self.builds.lock().get(&id).cloned()
    }

    pub fn insert_build(&self, build: Arc<Build>) {
        self.builds.lock().insert(build.id, build);
    }

    pub fn remove_build(&self, id: BuildId) -> Option<Arc<Build>> {
        let build = self.builds.lock().remove(&id)?;
        if let Some(top) = build.top_level_step() {
            self.release_orphaned(&top);
        }
        Some(build)
    }

    pub fn build_ids(&self) -> HashSet<BuildId> {
        self.builds.lock().keys().copied().collect()
    }

    pub fn get_or_create_jobset(&self, key: JobsetKey, shares: u32) {
        self.jobsets.lock().entry(key.clone()).or_insert_with(|| Jobset::new(key, shares));
    }

    /// Attaches a `Build` as a referrer of its top-level `Step`, tracking
    /// it in both the step's `builds` list and its accounting `jobsets`
    /// set (§3 "Step", §3 "Jobset").
    pub fn attach_build(step: &Arc<Step>, build: &Arc<Build>) {
        let mut state = step.state.lock();
        state.builds.push(Arc::downgrade(build));
        state.jobsets.insert(build.jobset.clone());
    }

    fn attach_dep(parent: &Arc<Step>, child: &Arc<Step>) {
        parent.state.lock().deps.insert(child.drv_path.clone());
        child.state.lock().rdeps.push(Arc::downgrade(parent));
    }

    /// Priority propagation down the dep DAG, monotone under `max` (§3
    /// "Invariants", §8 property 5, §4.1 "processQueueChange").
    pub fn propagate_priority(&self, top: &Arc<Step>, global: i64, local: i64, build_id: BuildId) {
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        queue.push_back(top.clone());
        while let Some(step) = queue.pop_front() {
            if !visited.insert(step.drv_path.clone()) {
                continue;
            }
            let dep_paths: Vec<DrvPath> = {
                let mut state = step.state.lock();
                state.bump_priorities(global, local, build_id);
                state.deps.iter().cloned().collect()
            };
            for dep_path in dep_paths {
                if let Some(dep) = self.get_step(&dep_path) {
                    queue.push_back(dep);
                }
            }
        }
    }

    fn push_runnable(&self, step: &Arc<Step>) {
        self.runnable.lock().push(Arc::downgrade(step));
    }

    /// Puts a step back on the runnable list after a failed attempt that
    /// still has retries left (§4.4 "Connection failures ... the step
    /// stays runnable and is retried on the next dispatch pass"). The
    /// caller is responsible for having already reset the step's status to
    /// [`StepStatus::Runnable`].
    pub fn requeue_runnable(&self, step: &Arc<Step>) {
        self.push_runnable(step);
    }

    /// A snapshot of runnable steps, pruning dead weak references as it
    /// goes (§4.2 "crossing them is a lookup operation that may observe a
    /// gone step", §4.3 step 3).
    pub fn runnable_steps(&self) -> Vec<Arc<Step>> {
        let mut runnable = self.runnable.lock();
        let live: Vec<Arc<Step>> = runnable.iter().filter_map(Weak::upgrade).collect();
        runnable.retain(|w| w.strong_count() > 0);
        live.into_iter()
            .filter(|s| matches!(s.state.lock().status, StepStatus::Runnable))
            .collect()
    }

    /// Drops a step from the runnable list once the dispatcher claims it.
    pub fn mark_active(&self, step: &Arc<Step>) {
        step.state.lock().status = StepStatus::Active;
        self.runnable.lock().retain(|w| !Weak::ptr_eq(w, &Arc::downgrade(step)));
    }

    /// §4.2: "When a Step completes, the monitor wakes every runnable
    /// rdep: for each rdep, erase `this` from its `deps`; if `deps` is now
    /// empty *and* `created==true`, append to the runnable list."
    pub fn on_step_done(&self, step: &Arc<Step>) -> Vec<Arc<Step>> {
        step.state.lock().status = StepStatus::Done;
        let rdeps: Vec<Arc<Step>> = step.state.lock().live_rdeps().collect();
        let mut woken = Vec::new();
        for rdep in rdeps {
            let became_runnable = {
                let mut state = rdep.state.lock();
                state.deps.remove(&step.drv_path);
                if state.is_runnable() && !matches!(state.status, StepStatus::Runnable) {
                    state.status = StepStatus::Runnable;
                    state.runnable_since = Some(Instant::now());
                    true
                } else {
                    false
                }
            };
            if became_runnable {
                self.push_runnable(&rdep);
                woken.push(rdep);
            }
        }
        woken
    }

    /// A step terminally failed (as opposed to finishing successfully):
    /// every step reachable through `rdeps` can never run either, so the
    /// whole reachable subtree is marked `Done` in one BFS pass rather than
    /// rippling through the runnable list one dependency at a time (§4.3
    /// "a step whose dependency failed never becomes runnable", §7
    /// `bsDepFailed`).
    ///
    /// Returns every step marked `Done` by the cascade, `step` included, so
    /// the caller can finish each one's builds (the first as the failure's
    /// origin, the rest as `bsDepFailed`).
    pub fn on_step_failed(&self, step: &Arc<Step>) -> Vec<Arc<Step>> {
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        let mut done = Vec::new();
        queue.push_back(step.clone());
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.drv_path.clone()) {
                continue;
            }
            let rdeps: Vec<Arc<Step>> = {
                let mut state = current.state.lock();
                state.status = StepStatus::Done;
                state.live_rdeps().collect()
            };
            self.runnable.lock().retain(|w| !Weak::ptr_eq(w, &Arc::downgrade(&current)));
            done.push(current);
            for rdep in rdeps {
                queue.push_back(rdep);
            }
        }
        done
    }

    /// §5 "Cancellation": an active step whose last referring build has
    /// gone away is marked cancelled so its worker observes it post-build.
    fn release_orphaned(&self, step: &Arc<Step>) {
        let mut state = step.state.lock();
        state.prune_dead();
        if state.live_builds().next().is_none() && matches!(state.status, StepStatus::Active) {
            state.cancelled = true;
        }
    }

    /// Prunes dead weak entries from the steps map (§4.3 step 3, §9 "scans
    /// must prune dead entries").
    pub fn prune_dead(&self) {
        self.steps.lock().retain(|_, w| w.strong_count() > 0);
    }

    /// §4.1's `createStep`: resolves a derivation path to a live `Step`, a
    /// fully-substituted no-op, or a cached failure — recursing into every
    /// input derivation along the way.
    pub fn create_step<'a>(
        &'a self,
        ctx: &'a CreateStepCtx<'a>,
        drv_path: &'a DrvPath,
        parent: Option<&'a Arc<Step>>,
    ) -> Pin<Box<dyn Future<Output = Result<CreateStepOutcome, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            if self.cached_done.lock().contains(drv_path) {
                return Ok(CreateStepOutcome::CachedDone);
            }

            if let Some(existing) = self.get_step(drv_path) {
                if let Some(parent) = parent {
                    Self::attach_dep(parent, &existing);
                }
                return Ok(CreateStepOutcome::Step(existing));
            }

            let derivation = ctx.derivation_store.read_derivation(drv_path).await?;

            for output in &derivation.outputs {
                if let Some(path) = &output.path {
                    if ctx.database.is_known_failed_path(path.as_str()).await? {
                        return Ok(CreateStepOutcome::PreviousFailure);
                    }
                }
            }

            let mut all_resolved = true;
            for output in &derivation.outputs {
                let Some(path) = &output.path else {
                    all_resolved = false;
                    continue;
                };
                let valid_at_destination = ctx.destination_store.query_path_info(path).await?.is_some();
                if valid_at_destination {
                    continue;
                }
                let available_locally = ctx.local_store.query_path_info(path).await?.is_some();
                let substitutable = if available_locally {
                    Self::copy_to_destination(ctx, path).await?;
                    true
                } else {
                    ctx.destination_store.try_substitute(path).await?
                };
                if substitutable {
                    self.record_substitution_step(ctx, drv_path, &derivation.system, output.name.as_str())
                        .await?;
                } else {
                    all_resolved = false;
                }
            }

            if all_resolved {
                self.cached_done.lock().insert(drv_path.clone());
                return Ok(CreateStepOutcome::CachedDone);
            }

            let input_drv_paths: Vec<DrvPath> = derivation.input_drvs.keys().cloned().collect();
            let step = Arc::new(Step::new(drv_path.clone(), derivation));
            for input_drv_path in &input_drv_paths {
                match self.create_step(ctx, input_drv_path, Some(&step)).await? {
                    CreateStepOutcome::Step(_) | CreateStepOutcome::CachedDone => {}
                    CreateStepOutcome::PreviousFailure => return Ok(CreateStepOutcome::PreviousFailure),
                }
            }

            let stepnr = ctx.stepnr.fetch_add(1, Ordering::SeqCst);
            {
                let mut state = step.state.lock();
                state.created = true;
                state.stepnr = Some(stepnr);
                if state.is_runnable() {
                    state.status = StepStatus::Runnable;
                    state.runnable_since = Some(Instant::now());
                }
            }
            ctx.database
                .upsert_build_step(BuildStepRow {
                    build: ctx.build_id.0,
                    stepnr,
                    step_type: 0,
                    drv_path: drv_path.as_str().to_string(),
                    busy: false,
                    start_time: None,
                    stop_time: None,
                    system: Some(step.derivation.system.clone()),
                    status: None,
                    propagated_from: None,
                    error_msg: None,
                    machine: None,
                    overhead: None,
                    times_built: 0,
                    is_non_deterministic: false,
                })
                .await?;
            let runnable = matches!(step.state.lock().status, StepStatus::Runnable);
            self.steps.lock().insert(drv_path.clone(), Arc::downgrade(&step));
            if runnable {
                self.push_runnable(&step);
            }
            if let Some(parent) = parent {
                Self::attach_dep(parent, &step);
            }
            Ok(CreateStepOutcome::Step(step))
        })
    }

    /// An output available in the local store but not yet at the
    /// destination: stream it across (§4.1 step 4, invariant 8 "every
    /// substituted path actually exists at the destination store"), reusing
    /// `builder_worker::import_one`'s export/import/plant-root pattern.
    async fn copy_to_destination(ctx: &CreateStepCtx<'_>, path: &StorePath) -> Result<(), EngineError> {
        let bytes = ctx.local_store.export_path(path).await?;
        let imported = ctx.destination_store.import_path(&bytes).await?;
        ctx.destination_store.plant_gc_root(ctx.gc_roots_dir, &imported).await?;
        Ok(())
    }

    async fn record_substitution_step(
        &self,
        ctx: &CreateStepCtx<'_>,
        drv_path: &DrvPath,
        system: &str,
        output_name: &str,
    ) -> Result<(), EngineError> {
        let stepnr = ctx.stepnr.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%drv_path, output = output_name, stepnr, "recording substitution step");
        ctx.database
            .upsert_build_step(BuildStepRow {
                build: ctx.build_id.0,
                stepnr,
                step_type: 1,
                drv_path: drv_path.as_str().to_string(),
                busy: false,
                start_time: None,
                stop_time: None,
                system: Some(system.to_string()),
                status: Some(0),
                propagated_from: None,
                error_msg: None,
                machine: None,
                overhead: None,
                times_built: 1,
                is_non_deterministic: false,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "step_graph_tests.rs"]
mod tests;
