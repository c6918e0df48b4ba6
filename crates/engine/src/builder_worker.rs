// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builder Worker: drives one active `Step` to completion on one machine
//! (§4.4 "Builder Worker algorithm").
//!
//! Connects, stages the step's input closure, sends `cmdBuildDerivation`,
//! imports the resulting outputs into the destination store, and maps the
//! wire result onto a [`qr_core::RemoteResult`]. Retry/back-off on
//! failure is the caller's job — this module only drives a single attempt.

use qr_adapters::{
    protocol, BuildDerivationRequest, BuilderTransport, ContentStore, DerivationStore, DerivationStoreError,
    ProtocolError, StoreError, TransportError,
};
use qr_core::{BuildOutput, BuildStatus, Clock, Machine, RemoteResult, Step, StorePath};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuilderWorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Derivation(#[from] DerivationStoreError),
    #[error("send lock on machine timed out after 600s")]
    SendLockTimeout,
    #[error("memory token semaphore closed")]
    MemoryTokensClosed,
}

/// Tunables a run of the worker needs that don't belong on `Step`/`Machine`
/// themselves (§6 "Configuration").
#[derive(Clone)]
pub struct BuilderWorkerConfig {
    pub max_log_size: u64,
    pub gc_roots_dir: std::path::PathBuf,
    /// Cap on the summed narSize of a step's outputs (§3 step 7, §6
    /// "max_output_size"). Checked against the local store before
    /// anything is copied to the destination store.
    pub max_output_size: u64,
    /// Ceiling backing the memory-token semaphore (§5 "a counted
    /// semaphore with a fixed ceiling"), used to clamp a single attempt's
    /// acquisition so an attempt larger than the ceiling doesn't block
    /// forever.
    pub memory_tokens_total: u64,
}

/// How long a build attempt waits to acquire its machine's send lock
/// before giving up (§5 "Per-Machine sendLock ... a timed_mutex with 600s
/// timeout").
const SEND_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// Extra headroom added to a step's summed output size before it's
/// clamped to the semaphore's total ceiling and acquired as memory tokens
/// (§4.4 step 7, §5).
const MEMORY_TOKEN_HEADROOM: u64 = 150 * 1024 * 1024;

/// Drives one build attempt: connect, handshake, build, import outputs
/// (§4.4 steps 2-6).
#[allow(clippy::too_many_arguments)]
pub async fn run_attempt(
    transport: &dyn BuilderTransport,
    local_store: &dyn ContentStore,
    destination_store: &dyn ContentStore,
    derivation_store: &dyn DerivationStore,
    machine: &Machine,
    step: &Arc<Step>,
    config: &BuilderWorkerConfig,
    clock: &impl Clock,
    memory_tokens: &tokio::sync::Semaphore,
    max_silent_time: u64,
    build_timeout: u64,
) -> Result<RemoteResult, BuilderWorkerError> {
    let start_time = clock.epoch_seconds();

    stage_inputs(local_store, destination_store, derivation_store, step, &config.gc_roots_dir).await?;

    let _send_guard = tokio::time::timeout(SEND_LOCK_TIMEOUT, machine.send_lock.lock())
        .await
        .map_err(|_| BuilderWorkerError::SendLockTimeout)?;

    let mut connection = transport.connect(machine).await?;
    let (reader, writer) = connection.stdio();
    let mut stream = tokio::io::join(reader, writer);
    let remote_version = protocol::handshake(&mut stream).await?;

    let env: Vec<(String, String)> = step.derivation.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let output_names: Vec<String> = step.derivation.output_names().map(String::from).collect();
    let req = BuildDerivationRequest {
        drv_path: step.drv_path.as_str(),
        outputs: &output_names,
        platform: &step.platform,
        builder: &step.derivation.builder,
        args: &step.derivation.args,
        env: &env,
        max_silent_time,
        build_timeout,
        max_log_size: config.max_log_size,
    };
    let result = protocol::send_build_derivation(&mut stream, remote_version, &req).await?;
    drop(_send_guard);

    let stop_time = clock.epoch_seconds();
    let status = if result.status == 0 { BuildStatus::Success } else { BuildStatus::Failed };

    let mut remote_result = RemoteResult::new(status, start_time, stop_time);
    if !result.error_msg.is_empty() {
        remote_result = remote_result.with_error(result.error_msg);
    }
    remote_result.times_built = result.times_built.max(1) as u32;
    remote_result.is_non_deterministic = result.is_non_deterministic;

    if status == BuildStatus::Success {
        match import_outputs(local_store, destination_store, step, config, memory_tokens).await? {
            ImportOutcome::Imported(output) => {
                remote_result.failed_with_output = output.failed_with_output;
                if output.failed_with_output {
                    remote_result.status = BuildStatus::FailedWithOutput;
                    remote_result.can_cache = remote_result.status.can_cache();
                    remote_result.can_retry = remote_result.status.can_retry();
                }
                remote_result.output = Some(output);
            }
            ImportOutcome::NarSizeLimitExceeded => {
                remote_result.status = BuildStatus::NarSizeLimitExceeded;
                remote_result.can_cache = remote_result.status.can_cache();
                remote_result.can_retry = remote_result.status.can_retry();
            }
        }
    }

    Ok(remote_result)
}

enum ImportOutcome {
    Imported(BuildOutput),
    NarSizeLimitExceeded,
}

/// Copies every output the derivation declares a fixed path for from the
/// local store into the destination store, plants its GC root, and reads
/// back whatever `nix-support` artifact files it declared (§4.4 step 6,
/// §3 step 7, §6 "gc_roots_dir", "Artifact files"). Outputs without a
/// statically known path (content-addressed derivations resolved only
/// after the build runs) are left for a future pass — the Derivation
/// Store port only reports what `nix derivation show` already knows ahead
/// of time.
async fn import_outputs(
    local_store: &dyn ContentStore,
    destination_store: &dyn ContentStore,
    step: &Arc<Step>,
    config: &BuilderWorkerConfig,
    memory_tokens: &tokio::sync::Semaphore,
) -> Result<ImportOutcome, BuilderWorkerError> {
    let paths: Vec<&StorePath> = step.derivation.outputs.iter().filter_map(|o| o.path.as_ref()).collect();

    let mut total_nar_size = 0u64;
    for path in &paths {
        if let Some(info) = local_store.query_path_info(path).await? {
            total_nar_size += info.nar_size;
        }
    }
    if total_nar_size > config.max_output_size {
        return Ok(ImportOutcome::NarSizeLimitExceeded);
    }

    let wanted = (total_nar_size + MEMORY_TOKEN_HEADROOM).min(config.memory_tokens_total).max(1) as u32;
    let _permit = memory_tokens
        .acquire_many(wanted)
        .await
        .map_err(|_| BuilderWorkerError::MemoryTokensClosed)?;

    let mut output = BuildOutput { nar_size: total_nar_size, ..Default::default() };
    let mut closure = std::collections::BTreeSet::new();

    for path in &paths {
        if destination_store.query_path_info(path).await?.is_none() {
            import_one(local_store, destination_store, path, &config.gc_roots_dir).await?;
        }

        let artifacts = local_store.read_artifacts(path).await?;
        output.products.extend(artifacts.products);
        output.metrics.extend(artifacts.metrics);
        if output.release_name.is_none() {
            output.release_name = artifacts.release_name;
        }
        output.failed_with_output |= artifacts.failed_with_output;

        closure.extend(local_store.compute_closure(std::slice::from_ref(*path)).await?);
    }

    let mut closure_size = 0u64;
    for path in &closure {
        if let Some(info) = local_store.query_path_info(path).await? {
            closure_size += info.nar_size;
        }
    }
    output.closure_size = closure_size;

    Ok(ImportOutcome::Imported(output))
}

/// Resolves the step's input closure (its direct `inputSrcs` plus every
/// output its `inputDrvs` actually references) and copies whatever isn't
/// already at the destination store, before the build is even sent (§4.4
/// step 4 "gather inputs").
async fn stage_inputs(
    local_store: &dyn ContentStore,
    destination_store: &dyn ContentStore,
    derivation_store: &dyn DerivationStore,
    step: &Arc<Step>,
    gc_roots_dir: &Path,
) -> Result<(), BuilderWorkerError> {
    let mut roots: Vec<StorePath> = step.derivation.input_srcs.iter().cloned().collect();
    for (drv_path, wanted_outputs) in &step.derivation.input_drvs {
        let input_derivation = derivation_store.read_derivation(drv_path).await?;
        for output in &input_derivation.outputs {
            if wanted_outputs.contains(&output.name) {
                if let Some(path) = &output.path {
                    roots.push(path.clone());
                }
            }
        }
    }

    let closure = local_store.compute_closure(&roots).await?;
    for path in &closure {
        if destination_store.query_path_info(path).await?.is_none() {
            import_one(local_store, destination_store, path, gc_roots_dir).await?;
        }
    }
    Ok(())
}

async fn import_one(
    local_store: &dyn ContentStore,
    destination_store: &dyn ContentStore,
    path: &StorePath,
    gc_roots_dir: &Path,
) -> Result<(), BuilderWorkerError> {
    let bytes = local_store.export_path(path).await?;
    let imported = destination_store.import_path(&bytes).await?;
    destination_store.plant_gc_root(gc_roots_dir, &imported).await?;
    Ok(())
}

#[cfg(test)]
#[path = "builder_worker_tests.rs"]
mod tests;
