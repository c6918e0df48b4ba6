// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue Monitor (§4.1): the one place that turns database rows into live
//! `Step`/`Build` graph nodes.
//!
//! `poll_queue_once` is `getQueuedBuilds` + `createStep` for every newly
//! seen build, followed by `processQueueChange` reconciling the rest. `run`
//! is the outer loop: poll, then block on a notification or a short
//! timeout, repeat.

use crate::error::EngineError;
use crate::step_graph::{CreateStepCtx, CreateStepOutcome, StepGraph};
use qr_adapters::{ContentStore, DerivationStore};
use qr_core::{Build, BuildId, BuildStatus, Clock, DrvPath, Event, JobsetKey};
use qr_storage::{
    records::{BuildRow, JobsetRow},
    Database, Notifier,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicI32;
use std::sync::Arc;
use std::time::Duration;

/// How long a full `getQueuedBuilds` scan may run before it yields the rest
/// of the batch to the next pass, so priority bumps observed mid-scan take
/// effect promptly rather than waiting for the whole batch to finish (§4.1
/// "yields every 60 seconds inside a large batch").
pub const BATCH_YIELD: Duration = Duration::from_secs(60);

/// Short timeout the outer loop blocks for between notifications, so a
/// missed pub/sub delivery is never fatal (§4.1 "blocks on notification or
/// a short timeout").
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a poll needs from the outside world (§4.1).
pub struct QueueMonitorDeps<'a, C: Clock> {
    pub database: &'a dyn Database,
    pub derivation_store: &'a dyn DerivationStore,
    pub local_store: &'a dyn ContentStore,
    pub destination_store: &'a dyn ContentStore,
    pub notifier: &'a dyn Notifier,
    pub stepnr: &'a AtomicI32,
    pub clock: &'a C,
    pub gc_roots_dir: &'a std::path::Path,
}

/// Runs the monitor forever: poll, then wait for a notification or
/// [`POLL_TIMEOUT`], repeat.
pub async fn run<C: Clock>(graph: &StepGraph, deps: &QueueMonitorDeps<'_, C>) -> Result<(), EngineError> {
    loop {
        poll_queue_once(graph, deps).await?;
        tokio::select! {
            _ = deps.notifier.recv() => {}
            _ = tokio::time::sleep(POLL_TIMEOUT) => {}
        }
    }
}

/// One `getQueuedBuilds` + `createStep` pass, followed by reconciling
/// removed builds and re-propagating priority (§4.1).
pub async fn poll_queue_once<C: Clock>(graph: &StepGraph, deps: &QueueMonitorDeps<'_, C>) -> Result<(), EngineError> {
    let rows = deps.database.list_queued_builds().await?;
    let jobsets = jobset_map(deps.database).await?;
    let known = graph.build_ids();
    let start = deps.clock.now();

    for row in &rows {
        if deps.clock.now().duration_since(start) > BATCH_YIELD {
            tracing::debug!("queue monitor yielding mid-batch after {:?}", BATCH_YIELD);
            break;
        }
        let build_id = BuildId::new(row.id);
        if known.contains(&build_id) {
            continue;
        }
        materialize_build(graph, deps, &jobsets, row).await?;
    }

    process_queue_change(graph, &rows);
    Ok(())
}

async fn jobset_map(database: &dyn Database) -> Result<HashMap<i64, JobsetRow>, EngineError> {
    Ok(database.list_enabled_jobsets().await?.into_iter().map(|row| (row.id, row)).collect())
}

async fn materialize_build<C: Clock>(
    graph: &StepGraph,
    deps: &QueueMonitorDeps<'_, C>,
    jobsets: &HashMap<i64, JobsetRow>,
    row: &BuildRow,
) -> Result<(), EngineError> {
    let build_id = BuildId::new(row.id);
    let drv_path = DrvPath::new(row.drv_path.clone());
    let ctx = CreateStepCtx {
        database: deps.database,
        derivation_store: deps.derivation_store,
        local_store: deps.local_store,
        destination_store: deps.destination_store,
        stepnr: deps.stepnr,
        build_id,
        gc_roots_dir: deps.gc_roots_dir,
    };

    match graph.create_step(&ctx, &drv_path, None).await? {
        CreateStepOutcome::Step(step) => {
            let jobset_row = jobsets.get(&row.jobset_id);
            let jobset_key = match jobset_row {
                Some(jr) => JobsetKey::new(jr.project.clone(), jr.name.clone()),
                None => {
                    tracing::warn!(jobset_id = row.jobset_id, "build references unknown jobset");
                    JobsetKey::new("unknown", "unknown")
                }
            };
            let shares = jobset_row.map(|jr| jr.scheduling_shares.max(1) as u32).unwrap_or(1);
            graph.get_or_create_jobset(jobset_key.clone(), shares);

            let build = Arc::new(Build::new(
                build_id,
                drv_path,
                jobset_key.project.clone(),
                jobset_key,
                row.job.clone(),
                row.timestamp as u64,
                row.priority,
                row.global_priority,
                row.maxsilent as u64,
                row.timeout as u64,
                &step,
            ));
            StepGraph::attach_build(&step, &build);
            graph.insert_build(build);
            graph.propagate_priority(&step, row.global_priority, row.priority, build_id);
        }
        CreateStepOutcome::CachedDone => {
            finish_and_notify(deps, row.id, build_id, BuildStatus::Success).await?;
        }
        CreateStepOutcome::PreviousFailure => {
            let status = classify_previous_failure(deps.database, deps.derivation_store, &drv_path).await?;
            finish_and_notify(deps, row.id, build_id, status).await?;
        }
    }
    Ok(())
}

/// §4.1 "On `PreviousFailure(step)` ... marks the Build as `bsFailed` (if
/// the failing step is the top) or `bsDepFailed` otherwise": re-reads the
/// build's own derivation and checks whether one of its own outputs (as
/// opposed to some transitive input's) is the one already in `FailedPaths`.
async fn classify_previous_failure(
    database: &dyn Database,
    derivation_store: &dyn DerivationStore,
    drv_path: &DrvPath,
) -> Result<BuildStatus, EngineError> {
    let derivation = derivation_store.read_derivation(drv_path).await?;
    for output in &derivation.outputs {
        if let Some(path) = &output.path {
            if database.is_known_failed_path(path.as_str()).await? {
                return Ok(BuildStatus::Failed);
            }
        }
    }
    Ok(BuildStatus::DepFailed)
}

async fn finish_and_notify<C: Clock>(
    deps: &QueueMonitorDeps<'_, C>,
    build_row_id: i64,
    build_id: BuildId,
    status: BuildStatus,
) -> Result<(), EngineError> {
    let now = deps.clock.epoch_seconds() as i64;
    deps.database
        .finish_build(build_row_id, status, now, now, None, None, None, true)
        .await?;
    deps.notifier
        .publish(Event::BuildFinished { build_id, status: status.as_i32() })
        .await
        .ok();
    Ok(())
}

/// §4.1 `processQueueChange`: builds no longer queued are dropped from the
/// graph (cancelling their active step if orphaned); builds still queued
/// have their priority re-propagated, which is safe to repeat every pass
/// since `bump_priorities` is monotone under `max`.
pub fn process_queue_change(graph: &StepGraph, rows: &[BuildRow]) -> Vec<BuildId> {
    let queued: HashSet<BuildId> = rows.iter().map(|r| BuildId::new(r.id)).collect();
    let known = graph.build_ids();
    let removed: Vec<BuildId> = known.difference(&queued).copied().collect();
    for id in &removed {
        graph.remove_build(*id);
    }

    for row in rows {
        let build_id = BuildId::new(row.id);
        if let Some(build) = graph.get_build(build_id) {
            if let Some(top) = build.top_level_step() {
                graph.propagate_priority(&top, row.global_priority, row.priority, build_id);
            }
        }
    }

    removed
}

#[cfg(test)]
#[path = "queue_monitor_tests.rs"]
mod tests;
