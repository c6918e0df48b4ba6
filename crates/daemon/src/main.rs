// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue runner daemon (`qrd`).
//!
//! `qrd run` starts the queue monitor, dispatch loop, and machines-file
//! watcher against one shared step graph and runs until a termination
//! signal. `qrd evaluate` runs one evaluator master pass against a release
//! expression and queues whatever jobs it finds, then exits — this is the
//! one-shot command a cron job or the `qr` CLI invokes per jobset.

use clap::{Parser, Subcommand};
use qr_core::RunnerConfig;
use qr_daemon::wiring::build_runtime;
use qr_engine::evaluator::{EvaluatorMasterConfig, SubprocessWorkerSpawner, WorkerSpawnConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "qrd", version, about = "Queue runner daemon")]
struct Cli {
    /// Path to the TOML configuration file (§6 "Configuration").
    #[arg(long, default_value = "/etc/qr/qrd.toml")]
    config: PathBuf,

    /// Log file to write to; stdout if unset.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue monitor, dispatcher, and machines watcher until killed.
    Run,
    /// Run one evaluator master pass and queue whatever jobs it finds.
    Evaluate {
        project: String,
        jobset: String,
        /// Nix expression file (or flake reference with `--flake`).
        expr: String,
        #[arg(long)]
        flake: bool,
        #[arg(long, default_value = "hydra-eval-jobs")]
        worker_binary: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _log_guard = qr_daemon::logging::init(cli.log_file.as_deref())?;

    let config = RunnerConfig::from_file(&cli.config).unwrap_or_else(|err| {
        tracing::warn!(path = %cli.config.display(), error = %err, "falling back to default configuration");
        RunnerConfig::default()
    });

    let runtime = Arc::new(build_runtime(&config).await?);

    match cli.command {
        Command::Run => run_forever(runtime).await,
        Command::Evaluate { project, jobset, expr, flake, worker_binary } => {
            let spawner = Arc::new(SubprocessWorkerSpawner::new(WorkerSpawnConfig {
                worker_binary,
                release_expr: expr,
                flake,
                auto_args: Vec::new(),
                gc_roots_dir: Some(config.gc_roots_dir.clone()),
                max_memory_kib: config.evaluator_max_memory_size / 1024,
            }));
            let eval_config = EvaluatorMasterConfig { workers: config.evaluator_workers as usize };
            let queued = runtime.run_evaluation_once(spawner, &eval_config, &project, &jobset).await?;
            info!(queued, project = %project, jobset = %jobset, "evaluation pass finished");
            Ok(())
        }
    }
}

async fn run_forever(runtime: Arc<qr_engine::Runtime<qr_core::SystemClock>>) -> Result<(), Box<dyn std::error::Error>> {
    info!("starting queue runner");

    let monitor_runtime = runtime.clone();
    let monitor = tokio::spawn(async move {
        if let Err(err) = monitor_runtime.run_queue_monitor().await {
            error!(error = %err, "queue monitor exited");
        }
    });

    let dispatch_runtime = runtime.clone();
    let dispatch = tokio::spawn(async move {
        if let Err(err) = dispatch_runtime.run_dispatch_loop().await {
            error!(error = %err, "dispatch loop exited");
        }
    });

    let machines_runtime = runtime.clone();
    let machines = tokio::spawn(async move {
        if let Err(err) = machines_runtime.run_machines_watcher().await {
            error!(error = %err, "machines watcher exited");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    monitor.abort();
    dispatch.abort();
    machines.abort();
    Ok(())
}
