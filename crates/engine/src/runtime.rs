// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level wiring: owns the long-lived adapters and in-memory graph and
//! drives the queue monitor, dispatch loop, and machines-file reload as
//! concurrent tasks sharing one [`StepGraph`] (§2 "Data flow").
//!
//! This is the one place in the crate that's allowed to know about every
//! port at once; everything downstream only sees the slice it needs.

use crate::dispatch_loop::{self, DispatchLoopDeps, RetryConfig};
use crate::error::EngineError;
use crate::queue_monitor::{self, QueueMonitorDeps, POLL_TIMEOUT};
use crate::step_graph::StepGraph;
use qr_adapters::{BuilderTransport, ContentStore, DerivationStore, MachinesFileWatcher};
use qr_core::{Clock, Machine, RunnerConfig};
use qr_storage::{Database, Notifier};
use std::sync::atomic::AtomicI32;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything [`Runtime`] needs from the outside world. Each field is a
/// port, not a concrete adapter, so tests can swap in fakes without
/// touching the wiring below (same split as [`QueueMonitorDeps`] and
/// [`DispatchLoopDeps`], just collected in one place).
pub struct RuntimeDeps<C: Clock> {
    pub database: Arc<dyn Database>,
    pub notifier: Arc<dyn Notifier>,
    pub derivation_store: Arc<dyn DerivationStore>,
    pub local_store: Arc<dyn ContentStore>,
    pub destination_store: Arc<dyn ContentStore>,
    pub transport: Arc<dyn BuilderTransport>,
    pub clock: C,
}

/// Tunables pulled out of [`RunnerConfig`] that the engine's loops consume
/// directly, so `Runtime` doesn't have to reach back into the raw config
/// struct from inside a task.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub retry: RetryConfig,
    pub worker_config: crate::builder_worker::BuilderWorkerConfig,
    pub machines_file: std::path::PathBuf,
    /// How long a runnable step may sit with no matching machine before
    /// it's failed as `bsUnsupported` (§6 "max_unsupported_time").
    pub max_unsupported_time: std::time::Duration,
    pub memory_tokens_total: u64,
}

impl RuntimeConfig {
    pub fn from_runner_config(config: &RunnerConfig) -> Self {
        Self {
            retry: RetryConfig {
                max_tries: config.max_tries,
                retry_interval_secs: config.retry_interval_secs,
                retry_backoff: config.retry_backoff,
                jitter_secs: 30,
            },
            worker_config: crate::builder_worker::BuilderWorkerConfig {
                max_log_size: config.max_log_size,
                gc_roots_dir: config.gc_roots_dir.clone(),
                max_output_size: config.max_output_size,
                memory_tokens_total: config.memory_tokens_total,
            },
            machines_file: config.machines_file.clone(),
            max_unsupported_time: std::time::Duration::from_secs(config.max_unsupported_time),
            memory_tokens_total: config.memory_tokens_total,
        }
    }
}

/// The live queue runner: one [`StepGraph`] shared by a queue-monitor task,
/// a dispatch-loop task, and a machines-file reload task (§2, §4.1, §4.3).
pub struct Runtime<C: Clock> {
    graph: Arc<StepGraph>,
    deps: Arc<RuntimeDeps<C>>,
    config: RuntimeConfig,
    stepnr: Arc<AtomicI32>,
    machines: Arc<RwLock<Vec<Arc<Machine>>>>,
    /// Constructed once for the runtime's lifetime, not per dispatch-loop
    /// pass, so permits an in-flight attempt holds are actually respected
    /// by attempts dispatched in later passes (§4.4 step 7, §5).
    memory_tokens: Arc<tokio::sync::Semaphore>,
}

impl<C: Clock + Clone> Runtime<C> {
    pub fn new(deps: RuntimeDeps<C>, config: RuntimeConfig, initial_machines: Vec<Machine>) -> Self {
        let memory_tokens = Arc::new(tokio::sync::Semaphore::new(config.memory_tokens_total as usize));
        Self {
            graph: Arc::new(StepGraph::new()),
            deps: Arc::new(deps),
            config,
            stepnr: Arc::new(AtomicI32::new(1)),
            machines: Arc::new(RwLock::new(initial_machines.into_iter().map(Arc::new).collect())),
            memory_tokens,
        }
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }

    pub async fn machines(&self) -> Vec<Arc<Machine>> {
        self.machines.read().await.clone()
    }

    async fn replace_machines(&self, fresh: Vec<Machine>) {
        let mut guard = self.machines.write().await;
        *guard = fresh.into_iter().map(Arc::new).collect();
    }

    /// Runs the queue monitor forever on the shared graph (§4.1).
    pub async fn run_queue_monitor(&self) -> Result<(), EngineError> {
        let monitor_deps = QueueMonitorDeps {
            database: self.deps.database.as_ref(),
            derivation_store: self.deps.derivation_store.as_ref(),
            local_store: self.deps.local_store.as_ref(),
            destination_store: self.deps.destination_store.as_ref(),
            notifier: self.deps.notifier.as_ref(),
            stepnr: &self.stepnr,
            clock: &self.deps.clock,
            gc_roots_dir: &self.config.worker_config.gc_roots_dir,
        };
        queue_monitor::run(&self.graph, &monitor_deps).await
    }

    /// Runs one dispatch pass on whatever machine fleet is currently
    /// loaded, waiting up to [`POLL_TIMEOUT`] between passes when nothing
    /// was runnable so the loop doesn't spin (§4.3 "doDispatch ... blocks
    /// on a CV with deadline").
    pub async fn run_dispatch_loop(&self) -> Result<(), EngineError> {
        loop {
            let dispatch_deps = Arc::new(DispatchLoopDeps {
                database: self.deps.database.clone(),
                local_store: self.deps.local_store.clone(),
                destination_store: self.deps.destination_store.clone(),
                derivation_store: self.deps.derivation_store.clone(),
                transport: self.deps.transport.clone(),
                machines: self.machines().await,
                clock: self.deps.clock.clone(),
                worker_config: self.config.worker_config.clone(),
                retry: self.config.retry,
                memory_tokens: self.memory_tokens.clone(),
                max_unsupported_time: self.config.max_unsupported_time,
            });
            let ran = dispatch_loop::dispatch_once(&self.graph, &dispatch_deps).await?;
            if ran == 0 {
                tokio::time::sleep(POLL_TIMEOUT).await;
            }
        }
    }

    /// Runs one evaluator master pass and queues every successfully
    /// evaluated job as a new build under `(project, jobset)` (§2 "Orthogonally:
    /// (expression file) → Evaluator Master → Evaluator Worker(s) →
    /// aggregated JSON → (DB populates queue)"). Jobs that came back with
    /// a per-attribute evaluation error are logged and skipped rather than
    /// queued, mirroring how the Queue Monitor itself never sees them.
    ///
    /// Returns the number of builds queued.
    pub async fn run_evaluation_once<S: crate::evaluator::WorkerSpawner>(
        &self,
        spawner: Arc<S>,
        eval_config: &crate::evaluator::EvaluatorMasterConfig,
        project: &str,
        jobset: &str,
    ) -> Result<usize, EngineError> {
        let mut jobs = crate::evaluator::evaluate(spawner, eval_config).await?;
        crate::evaluator::resolve_named_constituents(&mut jobs, self.deps.derivation_store.as_ref()).await?;

        let jobset_row = self.deps.database.get_or_create_jobset(project, jobset).await?;
        let now = self.deps.clock.epoch_seconds() as i64;
        let mut queued = 0;
        for (attr_path, job) in &jobs {
            if let Some(err) = &job.error {
                tracing::warn!(attr_path = %attr_path, error = %err, "job failed to evaluate, not queuing");
                continue;
            }
            if job.drv_path.is_empty() {
                continue;
            }
            self.deps
                .database
                .queue_build(qr_storage::records::NewBuild {
                    jobset_id: jobset_row.id,
                    job: job.name.clone(),
                    drv_path: job.drv_path.clone(),
                    maxsilent: job.max_silent,
                    timeout: job.timeout,
                    timestamp: now,
                    global_priority: job.scheduling_priority,
                    priority: job.scheduling_priority,
                })
                .await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Reloads the machine fleet from `machines_file` whenever it changes,
    /// replacing the in-memory list atomically; per-machine back-off state
    /// carries across reloads because it lives on each `Machine`, not the
    /// list (§3 "Machines are owned by a mapping replaced atomically").
    pub async fn run_machines_watcher(&self) -> Result<(), EngineError> {
        let path = self.config.machines_file.clone();
        let mut watcher = tokio::task::spawn_blocking(move || MachinesFileWatcher::new(vec![path]))
            .await
            .map_err(|e| EngineError::MachinesFile(e.to_string()))?
            .map_err(|e| EngineError::MachinesFile(e.to_string()))?;

        loop {
            let (returned_watcher, result) = tokio::task::spawn_blocking(move || {
                let result = watcher.poll_for_changes();
                (watcher, result)
            })
            .await
            .map_err(|e| EngineError::MachinesFile(e.to_string()))?;
            watcher = returned_watcher;
            if let Some(fresh) = result.map_err(|e| EngineError::MachinesFile(e.to_string()))? {
                tracing::info!(count = fresh.len(), "reloaded machines file");
                self.replace_machines(fresh).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
