// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Evaluator Master + Worker (§4.5, §4.6): drives a pool of evaluator
//! worker subprocesses over a newline-delimited pipe protocol to turn a
//! release expression into a `{attrPath: job}` map.
//!
//! The worker subprocess itself (loading the Nix expression, forcing
//! values, classifying attribute sets) is out of this crate's reach, the
//! same way `nix-store --serve` is opaque to the Builder Worker — this
//! module only speaks the line protocol and owns the shared `todo`/
//! `active`/`jobs` state the real `hydra-eval-jobs` binds to a condition
//! variable.

use async_trait::async_trait;
use parking_lot::Mutex;
use qr_adapters::{DerivationStore, DerivationStoreError};
use qr_core::DrvPath;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed worker message: {0}")]
    Malformed(String),
    #[error("worker raised a fatal error: {0}")]
    WorkerFatal(String),
    #[error("aggregate job '{0}' references non-existent job '{1}'")]
    UnknownConstituent(String, String),
    #[error("handler task panicked: {0}")]
    HandlerPanicked(String),
    #[error(transparent)]
    Derivation(#[from] DerivationStoreError),
}

fn default_scheduling_priority() -> i64 {
    100
}
fn default_timeout() -> i64 {
    36000
}
fn default_max_silent() -> i64 {
    7200
}

/// One evaluated job (§4.6's derivation-attribute-set reply fields).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "nixName", default)]
    pub name: String,
    #[serde(default)]
    pub system: String,
    #[serde(rename = "drvPath", default)]
    pub drv_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub maintainers: String,
    #[serde(rename = "schedulingPriority", default = "default_scheduling_priority")]
    pub scheduling_priority: i64,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(rename = "maxSilent", default = "default_max_silent")]
    pub max_silent: i64,
    #[serde(rename = "isChannel", default)]
    pub is_hydra_channel: bool,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Peer job names (as opposed to derivation paths) listed as plain
    /// strings in `constituents` (§4.6 "any list elements that are plain
    /// strings populate `namedConstituents`").
    #[serde(rename = "namedConstituents", default, skip_serializing_if = "Vec::is_empty")]
    pub named_constituents: Vec<String>,
    /// Derivation paths this aggregate depends on: forced-string-context
    /// entries arrive already resolved from the worker; named entries are
    /// appended by [`resolve_named_constituents`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constituents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply payload for one `"do <attrPath>"` request (§4.5 "Reply JSON").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvalReply {
    pub job: Option<JobDescriptor>,
    pub attrs: Option<Vec<String>>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FatalErrorLine {
    error: String,
}

/// One live evaluator worker subprocess's pipe endpoints.
#[async_trait]
pub trait WorkerHandle: Send {
    async fn send_line(&mut self, line: &str) -> Result<(), EvaluatorError>;
    async fn recv_line(&mut self) -> Result<String, EvaluatorError>;
}

/// Spawns evaluator worker subprocesses (§4.5 "Each handler owns one
/// worker subprocess at a time").
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    async fn spawn(&self) -> Result<Box<dyn WorkerHandle>, EvaluatorError>;
}

/// What a spawned worker evaluates and how (§4.5 "a single expression ...
/// and a set of auto-arguments").
pub struct WorkerSpawnConfig {
    pub worker_binary: std::path::PathBuf,
    pub release_expr: String,
    pub flake: bool,
    pub auto_args: Vec<(String, String)>,
    pub gc_roots_dir: Option<std::path::PathBuf>,
    pub max_memory_kib: u64,
}

/// Spawns the real evaluator worker binary, piping its stdin/stdout.
pub struct SubprocessWorkerSpawner {
    config: WorkerSpawnConfig,
}

impl SubprocessWorkerSpawner {
    pub fn new(config: WorkerSpawnConfig) -> Self {
        Self { config }
    }
}

struct SubprocessWorkerHandle {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[async_trait]
impl WorkerHandle for SubprocessWorkerHandle {
    async fn send_line(&mut self, line: &str) -> Result<(), EvaluatorError> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String, EvaluatorError> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        if n == 0 {
            return Err(EvaluatorError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "worker closed its stdout",
            )));
        }
        Ok(line.trim_end_matches('\n').to_string())
    }
}

impl Drop for SubprocessWorkerHandle {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl WorkerSpawner for SubprocessWorkerSpawner {
    async fn spawn(&self) -> Result<Box<dyn WorkerHandle>, EvaluatorError> {
        let mut cmd = Command::new(&self.config.worker_binary);
        if self.config.flake {
            cmd.arg("--flake");
        }
        if let Some(dir) = &self.config.gc_roots_dir {
            cmd.arg("--gc-roots-dir").arg(dir);
        }
        cmd.arg("--max-memory-kib").arg(self.config.max_memory_kib.to_string());
        for (name, value) in &self.config.auto_args {
            cmd.arg("--arg").arg(name).arg(value);
        }
        cmd.arg(&self.config.release_expr);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::inherit());

        let mut child = cmd.spawn().map_err(EvaluatorError::Spawn)?;
        let stdin = child.stdin.take().ok_or_else(|| EvaluatorError::Malformed("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| EvaluatorError::Malformed("no stdout".into()))?;
        Ok(Box::new(SubprocessWorkerHandle {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        }))
    }
}

/// Shared mutable state across handler tasks (§4.5 "`{todo, active, jobs,
/// exc}`").
#[derive(Default)]
struct MasterState {
    todo: VecDeque<String>,
    active: HashSet<String>,
    jobs: HashMap<String, JobDescriptor>,
    exc: Option<String>,
}

pub struct EvaluatorMasterConfig {
    pub workers: usize,
}

/// Runs the evaluator master to completion: spawns `config.workers`
/// handler tasks, each driving one worker subprocess at a time, until
/// `todo`/`active` both drain or a worker raises a fatal error (§4.5).
pub async fn evaluate<S: WorkerSpawner>(
    spawner: Arc<S>,
    config: &EvaluatorMasterConfig,
) -> Result<HashMap<String, JobDescriptor>, EvaluatorError> {
    let state = Arc::new(Mutex::new(MasterState {
        todo: VecDeque::from([String::new()]),
        ..Default::default()
    }));
    let wakeup = Arc::new(Notify::new());

    let mut handles = Vec::new();
    for _ in 0..config.workers.max(1) {
        let spawner = spawner.clone();
        let state = state.clone();
        let wakeup = wakeup.clone();
        handles.push(tokio::spawn(async move { run_handler(spawner.as_ref(), state, wakeup).await }));
    }

    for handle in handles {
        handle.await.map_err(|e| EvaluatorError::HandlerPanicked(e.to_string()))??;
    }

    let mut state = state.lock();
    if let Some(exc) = state.exc.take() {
        return Err(EvaluatorError::WorkerFatal(exc));
    }
    Ok(std::mem::take(&mut state.jobs))
}

/// One handler's lifetime: fork a worker if needed, read a line, act on it
/// (§4.5 "Handler loop").
async fn run_handler<S: WorkerSpawner>(
    spawner: &S,
    state: Arc<Mutex<MasterState>>,
    wakeup: Arc<Notify>,
) -> Result<(), EvaluatorError> {
    let mut worker: Option<Box<dyn WorkerHandle>> = None;

    loop {
        if worker.is_none() {
            worker = Some(spawner.spawn().await?);
        }
        let handle = worker.as_mut().unwrap_or_else(|| unreachable!("just assigned"));

        let line = handle.recv_line().await?;
        if line == "restart" {
            worker = None;
            continue;
        }
        if line != "next" {
            let fatal: FatalErrorLine =
                serde_json::from_str(&line).map_err(|e| EvaluatorError::Malformed(e.to_string()))?;
            state.lock().exc = Some(fatal.error.clone());
            wakeup.notify_waiters();
            return Err(EvaluatorError::WorkerFatal(fatal.error));
        }

        let attr_path = loop {
            {
                let mut s = state.lock();
                if s.exc.is_some() || (s.todo.is_empty() && s.active.is_empty()) {
                    handle.send_line("exit").await?;
                    return Ok(());
                }
                if let Some(path) = s.todo.pop_front() {
                    s.active.insert(path.clone());
                    break path;
                }
            }
            // Bounded by a short poll alongside the notify wait, in case a
            // wakeup lands between the check above and subscribing here.
            tokio::select! {
                _ = wakeup.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        };

        handle.send_line(&format!("do {attr_path}")).await?;
        let reply_line = handle.recv_line().await?;
        let reply: EvalReply =
            serde_json::from_str(&reply_line).map_err(|e| EvaluatorError::Malformed(e.to_string()))?;

        let mut new_attrs = Vec::new();
        if let Some(attrs) = &reply.attrs {
            for name in attrs {
                new_attrs.push(if attr_path.is_empty() {
                    name.clone()
                } else {
                    format!("{attr_path}.{name}")
                });
            }
        }

        let mut s = state.lock();
        if let Some(job) = reply.job {
            s.jobs.insert(attr_path.clone(), job);
        }
        if let Some(error) = reply.error {
            s.jobs.entry(attr_path.clone()).or_default().error = Some(error);
        }
        s.active.remove(&attr_path);
        for attr in new_attrs {
            s.todo.push_back(attr);
        }
        drop(s);
        wakeup.notify_waiters();
    }
}

/// §4.5's post-pass: for every job with `namedConstituents`, resolve each
/// peer job name to its derivation path, append it to `constituents`, and
/// rewrite the aggregate's own derivation so it actually depends on its
/// constituents at the store level (extending `inputDrvs` changes the
/// derivation's hash, which changes its store path — the same reason
/// `write_derivation` hands back a fresh [`DrvPath`] rather than mutating
/// one in place).
pub async fn resolve_named_constituents(
    jobs: &mut HashMap<String, JobDescriptor>,
    derivation_store: &dyn DerivationStore,
) -> Result<(), EvaluatorError> {
    let pending: Vec<(String, Vec<String>)> = jobs
        .iter()
        .filter(|(_, job)| !job.named_constituents.is_empty())
        .map(|(name, job)| (name.clone(), job.named_constituents.clone()))
        .collect();

    for (name, named) in pending {
        let mut resolved = Vec::with_capacity(named.len());
        for peer in &named {
            let drv_path = jobs
                .get(peer)
                .map(|job| job.drv_path.clone())
                .ok_or_else(|| EvaluatorError::UnknownConstituent(name.clone(), peer.clone()))?;
            resolved.push(drv_path);
        }

        let Some(job) = jobs.get(&name) else { continue };
        if job.drv_path.is_empty() {
            continue;
        }
        let mut derivation = derivation_store.read_derivation(&DrvPath::new(job.drv_path.clone())).await?;
        for constituent in &resolved {
            derivation
                .input_drvs
                .entry(DrvPath::new(constituent.clone()))
                .or_default()
                .insert("out".to_string());
        }
        let new_drv_path = derivation_store.write_derivation(&derivation).await?;

        let job = jobs.get_mut(&name).unwrap_or_else(|| unreachable!("just looked up"));
        job.constituents.extend(resolved);
        job.drv_path = new_drv_path.as_str().to_string();
    }
    Ok(())
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;

    /// Scripted worker subprocess: `recv_line` replays a fixed sequence of
    /// lines, `send_line` just records what the handler sent.
    pub struct FakeWorkerHandle {
        script: VecDeque<String>,
        pub sent: Vec<String>,
    }

    #[async_trait]
    impl WorkerHandle for FakeWorkerHandle {
        async fn send_line(&mut self, line: &str) -> Result<(), EvaluatorError> {
            self.sent.push(line.to_string());
            Ok(())
        }

        async fn recv_line(&mut self) -> Result<String, EvaluatorError> {
            self.script
                .pop_front()
                .ok_or_else(|| EvaluatorError::Malformed("fake worker script exhausted".into()))
        }
    }

    /// Hands out one scripted [`FakeWorkerHandle`] per `spawn` call, in the
    /// order scripts were pushed. Reusing the same script for a `restart`
    /// respawn is the caller's job: push it again if the test needs one.
    #[derive(Clone, Default)]
    pub struct FakeWorkerSpawner {
        scripts: Arc<Mutex<VecDeque<Vec<String>>>>,
        spawn_count: Arc<Mutex<usize>>,
    }

    impl FakeWorkerSpawner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_script(&self, lines: Vec<&str>) {
            self.scripts.lock().push_back(lines.into_iter().map(String::from).collect());
        }

        pub fn spawn_count(&self) -> usize {
            *self.spawn_count.lock()
        }
    }

    #[async_trait]
    impl WorkerSpawner for FakeWorkerSpawner {
        async fn spawn(&self) -> Result<Box<dyn WorkerHandle>, EvaluatorError> {
            *self.spawn_count.lock() += 1;
            let script = self.scripts.lock().pop_front().unwrap_or_default();
            Ok(Box::new(FakeWorkerHandle {
                script: script.into(),
                sent: Vec::new(),
            }))
        }
    }
}

#[cfg(test)]
#[path = "evaluator_tests.rs"]
mod tests;
