// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `qr`: thin operator CLI over the `Database` port (§4.8 "a thin but real
//! CLI for operational visibility"). It talks directly to Postgres; it
//! does not go through the daemon, the same way `hydra-queue-runner`'s
//! sibling scripts just run SQL.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qr_storage::{Database, PostgresDatabase};

#[derive(Parser)]
#[command(name = "qr", version, about = "Queue runner operator CLI")]
struct Cli {
    /// Postgres connection string; falls back to `$QR_DATABASE_URL`.
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List currently queued builds.
    Status,
    /// Raise a queued build's priority.
    Bump { build_id: i64, priority: i64 },
    /// Re-queue a finished build for another attempt.
    Restart { build_id: i64 },
    /// Cancel a queued or in-progress build.
    Cancel { build_id: i64 },
    /// Remove a build from the queue entirely.
    Delete { build_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let database_url = cli
        .database_url
        .or_else(|| std::env::var("QR_DATABASE_URL").ok())
        .context("no --database-url given and $QR_DATABASE_URL is unset")?;
    let database = PostgresDatabase::connect(&database_url, 4).await.context("connecting to the queue database")?;

    match cli.command {
        Command::Status => {
            let rows = database.list_queued_builds().await.context("listing queued builds")?;
            for row in rows {
                println!("{}\t{}\t{}\tpriority={}", row.id, row.job, row.drv_path, row.priority);
            }
        }
        Command::Bump { build_id, priority } => {
            database.bump_build_priority(build_id, priority).await.context("bumping priority")?;
            println!("bumped build {build_id} to priority {priority}");
        }
        Command::Restart { build_id } => {
            database.restart_build(build_id).await.context("restarting build")?;
            println!("restarted build {build_id}");
        }
        Command::Cancel { build_id } => {
            database.cancel_build(build_id).await.context("cancelling build")?;
            println!("cancelled build {build_id}");
        }
        Command::Delete { build_id } => {
            database.delete_build(build_id).await.context("deleting build")?;
            println!("deleted build {build_id}");
        }
    }
    Ok(())
}
