// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Turns a [`RunnerConfig`] into a fully wired [`Runtime`] backed by the
//! real `sqlx`/Postgres and local-store adapters (§6 "External
//! interfaces"). Test code builds a `Runtime` directly from fakes instead
//! of going through here.

use qr_adapters::{machines, LocalDerivationStore, LocalStore, MachinesFileError, SubprocessTransport};
use qr_core::{CoreError, RunnerConfig, SystemClock};
use qr_engine::{Runtime, RuntimeConfig, RuntimeDeps};
use qr_storage::{DbError, NotifyError, PostgresDatabase, PostgresNotifier};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] CoreError),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("notifier error: {0}")]
    Notifier(#[from] NotifyError),
    #[error("machines file error: {0}")]
    MachinesFile(#[from] MachinesFileError),
}

/// Connects every real adapter and returns a [`Runtime`] ready to have its
/// loops spawned. The caller owns the returned `Runtime`'s lifetime and
/// decides which loops to run (`run_queue_monitor`, `run_dispatch_loop`,
/// `run_machines_watcher`).
pub async fn build_runtime(config: &RunnerConfig) -> Result<Runtime<SystemClock>, DaemonError> {
    config.validate()?;

    let database = PostgresDatabase::connect(&config.database_url, config.max_db_connections).await?;
    database.migrate().await?;
    let notifier = PostgresNotifier::connect(&config.database_url).await?;

    let deps = RuntimeDeps {
        database: Arc::new(database),
        notifier: Arc::new(notifier),
        derivation_store: Arc::new(LocalDerivationStore::new()),
        local_store: Arc::new(LocalStore::new(&config.store_uri)),
        destination_store: Arc::new(LocalStore::new(&config.store_uri)),
        transport: Arc::new(SubprocessTransport::new()),
        clock: SystemClock,
    };
    let runtime_config = RuntimeConfig::from_runner_config(config);

    // `run_machines_watcher` only reports changes after this baseline, so
    // the initial fleet has to be loaded here, once, up front.
    let initial_machines = if config.machines_file.exists() {
        machines::load(&config.machines_file)?
    } else {
        Vec::new()
    };

    Ok(Runtime::new(deps, runtime_config, initial_machines))
}
