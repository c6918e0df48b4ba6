// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wires the pure [`crate::dispatcher`] matching into actually running
//! [`crate::builder_worker`] attempts and feeding their outcome back into
//! the [`StepGraph`] and [`Database`] (§4.3 "doDispatch", §4.4 "Builder
//! Worker algorithm").
//!
//! One call to [`dispatch_once`] claims every currently-runnable step it
//! can match to a free machine slot and runs every matched attempt
//! concurrently via [`tokio::task::JoinSet`], so a build on one machine
//! doesn't block a build on another.

use crate::builder_worker::{self, BuilderWorkerConfig};
use crate::dispatcher;
use crate::error::EngineError;
use crate::step_graph::StepGraph;
use qr_adapters::{BuilderTransport, ContentStore, DerivationStore};
use qr_core::{BuildOutput, BuildStatus, Clock, Machine, Step, StepStatus};
use qr_storage::records::{BuildMetricRow, BuildProductRow, BuildStepOutputRow, BuildStepRow};
use qr_storage::Database;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Back-off tunables for [`qr_core::machine::ConnectState::record_failure`]
/// (§4.4 "Connection failures trigger exponential back-off").
#[derive(Clone, Copy)]
pub struct RetryConfig {
    pub max_tries: u32,
    pub retry_interval_secs: u64,
    pub retry_backoff: f64,
    pub jitter_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_tries: 5, retry_interval_secs: 30, retry_backoff: 3.0, jitter_secs: 30 }
    }
}

/// Shared, owned form of everything a dispatched attempt needs, so each
/// one can be handed to its own spawned task instead of borrowing from a
/// caller-local stack frame.
pub struct DispatchLoopDeps<C: Clock> {
    pub database: Arc<dyn Database>,
    pub local_store: Arc<dyn ContentStore>,
    pub destination_store: Arc<dyn ContentStore>,
    pub derivation_store: Arc<dyn DerivationStore>,
    pub transport: Arc<dyn BuilderTransport>,
    pub machines: Vec<Arc<Machine>>,
    pub clock: C,
    pub worker_config: BuilderWorkerConfig,
    pub retry: RetryConfig,
    /// Counted semaphore bounding concurrent output-import memory use
    /// across every attempt in flight (§4.4 step 7, §5). Owned once on
    /// `Runtime`, not reconstructed per pass, so permits held by an
    /// in-flight attempt are actually respected by the next one.
    pub memory_tokens: Arc<tokio::sync::Semaphore>,
    /// A step that's been runnable this long without ever matching a
    /// machine is failed as `bsUnsupported` (§6 "max_unsupported_time").
    pub max_unsupported_time: Duration,
}

/// Per-attempt facts `run_one`/`fail_step` need in order to write a
/// terminal `BuildSteps` row once the attempt (or the whole cascade) is
/// done (§6 "BuildSteps" columns `machine`, `startTime`, `stopTime`,
/// `errorMsg`, `timesBuilt`, `isNonDeterministic`).
#[derive(Clone, Default)]
struct StepAttemptMeta {
    machine: String,
    start_time: i64,
    stop_time: i64,
    error_msg: Option<String>,
    times_built: i32,
    is_non_deterministic: bool,
}

/// One dispatch pass: matches runnable steps to free machine slots, then
/// runs every matched attempt to completion concurrently, applying each
/// result to the graph, database, and machine back-off state as it lands
/// (§4.3 step 4, §4.4 steps 2-7).
///
/// Returns the number of attempts it ran. A real daemon calls this in a
/// loop woken by [`crate::queue_monitor`] notifications and step
/// completions; tests can call it directly and inspect the graph/database
/// afterward instead of racing a background task.
pub async fn dispatch_once<C: Clock>(
    graph: &Arc<StepGraph>,
    deps: &Arc<DispatchLoopDeps<C>>,
) -> Result<usize, EngineError> {
    let runnable = graph.runnable_steps();
    let dispatches = dispatcher::dispatch_round(&runnable, &deps.machines, &deps.clock);
    let dispatched: HashSet<_> = dispatches.iter().map(|d| d.step.drv_path.clone()).collect();

    for step in &runnable {
        if dispatched.contains(&step.drv_path) {
            continue;
        }
        if step_is_unsupported(step, &deps.clock, deps.max_unsupported_time) {
            tracing::warn!(drv_path = %step.drv_path, "step unsupported: no machine has ever matched it");
            fail_step(graph, deps, step, BuildStatus::Unsupported).await?;
        }
    }

    for dispatch in &dispatches {
        deps.machines[dispatch.machine_index].state.lock().current_jobs += 1;
        graph.mark_active(&dispatch.step);
    }

    let mut tasks = tokio::task::JoinSet::new();
    for dispatch in dispatches {
        let graph = graph.clone();
        let deps = deps.clone();
        let machine = deps.machines[dispatch.machine_index].clone();
        tasks.spawn(async move { run_one(&graph, &deps, &machine, &dispatch.step).await });
    }

    let mut ran = 0;
    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| EngineError::TaskJoin(e.to_string()))??;
        ran += 1;
    }
    Ok(ran)
}

/// §6 "max_unsupported_time": a step that has never been tried and has
/// sat runnable longer than the configured ceiling with no machine ever
/// matching it.
fn step_is_unsupported<C: Clock>(step: &Arc<Step>, clock: &C, max_unsupported_time: Duration) -> bool {
    let state = step.state.lock();
    if state.tries != 0 {
        return false;
    }
    match state.runnable_since {
        Some(since) => clock.now().saturating_duration_since(since) >= max_unsupported_time,
        None => false,
    }
}

/// The step's own `maxSilentTime`/`buildTimeout` ceiling is really a
/// per-`Build` setting; a step shared by several live builds (the common
/// substitution-free case) uses whichever is largest, so no build's
/// configured patience is ever undercut by another's (§4.4 step 2).
fn effective_timeouts(step: &Arc<Step>) -> (u64, u64) {
    step.state
        .lock()
        .live_builds()
        .fold((0u64, 0u64), |(silent, timeout), build| {
            (silent.max(build.max_silent_time), timeout.max(build.build_timeout))
        })
}

async fn run_one<C: Clock>(
    graph: &Arc<StepGraph>,
    deps: &Arc<DispatchLoopDeps<C>>,
    machine: &Arc<Machine>,
    step: &Arc<Step>,
) -> Result<(), EngineError> {
    let start_time = deps.clock.epoch_seconds() as i64;
    write_build_step_rows(deps, step, |row| {
        row.busy = true;
        row.start_time = Some(start_time);
        row.machine = Some(machine.name.as_str().to_string());
    })
    .await?;

    let (max_silent_time, build_timeout) = effective_timeouts(step);
    let attempt = builder_worker::run_attempt(
        deps.transport.as_ref(),
        deps.local_store.as_ref(),
        deps.destination_store.as_ref(),
        deps.derivation_store.as_ref(),
        machine,
        step,
        &deps.worker_config,
        &deps.clock,
        &deps.memory_tokens,
        max_silent_time,
        build_timeout,
    )
    .await;

    machine.state.lock().current_jobs = machine.state.lock().current_jobs.saturating_sub(1);

    match attempt {
        Ok(result) => {
            tracing::debug!(
                drv_path = %step.drv_path,
                machine = %machine.name.as_str(),
                status = ?result.status,
                "build attempt finished"
            );
            machine.state.lock().record_success();
            let meta = StepAttemptMeta {
                machine: machine.name.as_str().to_string(),
                start_time: result.start_time as i64,
                stop_time: result.stop_time as i64,
                error_msg: result.error_msg.clone(),
                times_built: result.times_built as i32,
                is_non_deterministic: result.is_non_deterministic,
            };
            if result.status == BuildStatus::Success || result.status == BuildStatus::FailedWithOutput {
                finish_builds_for_step(deps, step, result.status, result.output.as_ref(), Some(&meta)).await?;
                graph.on_step_done(step);
            } else {
                fail_step_with_meta(graph, deps, step, result.status, Some(meta)).await?;
            }
        }
        Err(err) => {
            tracing::warn!(drv_path = %step.drv_path, machine = %machine.name.as_str(), error = %err, "build attempt failed");
            machine.state.lock().record_failure(
                deps.clock.now(),
                deps.retry.retry_interval_secs,
                deps.retry.retry_backoff,
                deps.retry.jitter_secs,
                rand::random(),
            );
            let tries = {
                let mut state = step.state.lock();
                state.tries += 1;
                state.tries
            };
            if tries < deps.retry.max_tries {
                step.state.lock().status = StepStatus::Runnable;
                graph.requeue_runnable(step);
            } else {
                let meta = StepAttemptMeta {
                    machine: machine.name.as_str().to_string(),
                    start_time,
                    stop_time: deps.clock.epoch_seconds() as i64,
                    error_msg: Some(err.to_string()),
                    times_built: 0,
                    is_non_deterministic: false,
                };
                fail_step_with_meta(graph, deps, step, BuildStatus::Aborted, Some(meta)).await?;
            }
        }
    }
    Ok(())
}

async fn fail_step<C: Clock>(
    graph: &Arc<StepGraph>,
    deps: &Arc<DispatchLoopDeps<C>>,
    step: &Arc<Step>,
    origin_status: BuildStatus,
) -> Result<(), EngineError> {
    fail_step_with_meta(graph, deps, step, origin_status, None).await
}

/// A step terminally failed, either as the origin (`origin_status`,
/// carrying `meta` when an attempt actually ran) or as a cascaded
/// dependency (`bsDepFailed`, no attempt of its own to report).
async fn fail_step_with_meta<C: Clock>(
    graph: &Arc<StepGraph>,
    deps: &Arc<DispatchLoopDeps<C>>,
    step: &Arc<Step>,
    origin_status: BuildStatus,
    meta: Option<StepAttemptMeta>,
) -> Result<(), EngineError> {
    let cascaded = graph.on_step_failed(step);
    for (i, failed_step) in cascaded.iter().enumerate() {
        let status = if i == 0 { origin_status } else { BuildStatus::DepFailed };
        let step_meta = if i == 0 { meta.as_ref() } else { None };
        finish_builds_for_step(deps, failed_step, status, None, step_meta).await?;
    }
    Ok(())
}

/// Writes one `BuildSteps` row per live build referencing `step`, all
/// sharing the step's own `stepnr` (§6: `stepnr` is assigned once per
/// `Step`, not per `(build, step)` pair; the table's primary key is
/// `(build, stepnr)`, so every build that ever references this step reuses
/// the same number safely). A step not yet assigned a `stepnr` (shouldn't
/// happen once `created`) is silently skipped.
async fn write_build_step_rows<C: Clock>(
    deps: &Arc<DispatchLoopDeps<C>>,
    step: &Arc<Step>,
    customize: impl Fn(&mut BuildStepRow),
) -> Result<(), EngineError> {
    let Some(stepnr) = step.state.lock().stepnr else { return Ok(()) };
    let builds = step.state.lock().live_builds().collect::<Vec<_>>();
    for build in &builds {
        let mut row = BuildStepRow {
            build: build.id.0,
            stepnr,
            step_type: 0,
            drv_path: step.drv_path.as_str().to_string(),
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
        };
        customize(&mut row);
        deps.database.upsert_build_step(row).await?;
    }
    Ok(())
}

/// Marks every live build for `step` finished and, when the attempt
/// produced a [`BuildOutput`], records its size/closure/release name on
/// the build row and writes its products and metrics (§3 "Build Output",
/// §4.3 "finishBuild"). Also writes the terminal `BuildSteps` row for the
/// attempt, the step's own declared outputs (so future `createStep` calls
/// can resolve them by substitution), and marks them permanently failed
/// when the status is a cacheable failure (§7 table, §4.1 step 2).
async fn finish_builds_for_step<C: Clock>(
    deps: &Arc<DispatchLoopDeps<C>>,
    step: &Arc<Step>,
    status: BuildStatus,
    output: Option<&BuildOutput>,
    attempt: Option<&StepAttemptMeta>,
) -> Result<(), EngineError> {
    let builds = step.state.lock().live_builds().collect::<Vec<_>>();
    let now = deps.clock.epoch_seconds() as i64;
    let stepnr = step.state.lock().stepnr;

    write_build_step_rows(deps, step, |row| {
        row.busy = false;
        row.status = Some(status.as_i32());
        match attempt {
            Some(meta) => {
                row.start_time = Some(meta.start_time);
                row.stop_time = Some(meta.stop_time);
                row.machine = Some(meta.machine.clone());
                row.error_msg = meta.error_msg.clone();
                row.times_built = meta.times_built;
                row.is_non_deterministic = meta.is_non_deterministic;
            }
            None => row.stop_time = Some(now),
        }
    })
    .await?;

    if status != BuildStatus::Success && status.can_cache() {
        for declared in &step.derivation.outputs {
            if let Some(path) = &declared.path {
                deps.database.mark_path_failed(path.as_str()).await?;
            }
        }
    }

    for build in &builds {
        deps.database
            .finish_build(
                build.id.0,
                status,
                now,
                now,
                output.map(|o| o.nar_size as i64),
                output.map(|o| o.closure_size as i64),
                output.and_then(|o| o.release_name.clone()),
                false,
            )
            .await?;

        if output.is_some() {
            if let Some(stepnr) = stepnr {
                for declared in &step.derivation.outputs {
                    if let Some(path) = &declared.path {
                        deps.database
                            .record_step_output(BuildStepOutputRow {
                                build: build.id.0,
                                stepnr,
                                name: declared.name.clone(),
                                path: path.as_str().to_string(),
                            })
                            .await?;
                    }
                }
            }
        }

        let Some(output) = output else { continue };
        for (i, product) in output.products.iter().enumerate() {
            deps.database
                .record_build_product(BuildProductRow {
                    build: build.id.0,
                    productnr: i as i32 + 1,
                    product_type: product.product_type.clone(),
                    subtype: product.subtype.clone(),
                    file_size: product.file_size.map(|s| s as i64),
                    sha256hash: product.sha256_hash.clone(),
                    path: Some(product.path.clone()),
                    name: Some(product.name.clone()),
                    default_path: Some(product.default_path.clone()),
                })
                .await?;
        }
        for metric in &output.metrics {
            deps.database
                .record_build_metric(BuildMetricRow {
                    build: build.id.0,
                    name: metric.name.clone(),
                    unit: metric.unit.clone(),
                    value: metric.value,
                    project: build.project.clone(),
                    jobset: build.jobset.name.clone(),
                    job: build.job.clone(),
                    timestamp: now,
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "dispatch_loop_tests.rs"]
mod tests;
