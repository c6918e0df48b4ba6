// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `Database` port (§6 "Database schema used").

use crate::records::{
    BuildMetricRow, BuildProductRow, BuildRow, BuildStepOutputRow, BuildStepRow, JobsetRow, NewBuild,
};
use async_trait::async_trait;
use qr_core::BuildStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("build {0} not found")]
    BuildNotFound(i64),
    #[error("jobset not found: {project}:{name}")]
    JobsetNotFound { project: String, name: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("pool error: {0}")]
    Pool(String),
}

/// Persistent state the queue runner reads and writes (§6 "Database schema
/// used").
///
/// Every write that the spec describes as happening "in one transaction"
/// (queueing a build + bumping its step's priorities; finishing a build +
/// marking its outputs) is a single trait method here, so the Postgres
/// implementation can wrap it in one `sqlx::Transaction` and the in-memory
/// fake can apply it atomically under one lock.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn get_or_create_jobset(&self, project: &str, name: &str) -> Result<JobsetRow, DbError>;
    async fn set_jobset_shares(&self, jobset_id: i64, shares: i64) -> Result<(), DbError>;
    async fn list_enabled_jobsets(&self) -> Result<Vec<JobsetRow>, DbError>;

    /// Inserts a new, unfinished build row. Returns the assigned,
    /// monotonically increasing `BuildId` (§3 "Build").
    async fn queue_build(&self, build: NewBuild) -> Result<i64, DbError>;
    async fn get_build(&self, id: i64) -> Result<BuildRow, DbError>;
    /// All builds with `finished = false`, ordered by id (§4.1 step 1).
    async fn list_queued_builds(&self) -> Result<Vec<BuildRow>, DbError>;
    async fn bump_build_priority(&self, id: i64, priority: i64) -> Result<(), DbError>;
    async fn restart_build(&self, id: i64) -> Result<(), DbError>;
    async fn cancel_build(&self, id: i64) -> Result<(), DbError>;
    async fn delete_build(&self, id: i64) -> Result<(), DbError>;

    /// Marks a build finished with a terminal status, in the same
    /// transaction as its step row and output rows (§4.3 "finishBuild").
    async fn finish_build(
        &self,
        id: i64,
        status: BuildStatus,
        start_time: i64,
        stop_time: i64,
        size: Option<i64>,
        closure_size: Option<i64>,
        release_name: Option<String>,
        is_cached_build: bool,
    ) -> Result<(), DbError>;

    /// Upserts a `BuildSteps` row, retrying on `stepnr` collision per §6
    /// ("with `on conflict do nothing` retried on `stepnr` collision").
    async fn upsert_build_step(&self, row: BuildStepRow) -> Result<(), DbError>;
    async fn record_step_output(&self, row: BuildStepOutputRow) -> Result<(), DbError>;
    async fn record_build_product(&self, row: BuildProductRow) -> Result<(), DbError>;
    async fn record_build_metric(&self, row: BuildMetricRow) -> Result<(), DbError>;

    async fn is_known_failed_path(&self, path: &str) -> Result<bool, DbError>;
    async fn mark_path_failed(&self, path: &str) -> Result<(), DbError>;

    async fn set_system_status(&self, what: &str, status: serde_json::Value) -> Result<(), DbError>;
    async fn get_system_status(&self, what: &str) -> Result<Option<serde_json::Value>, DbError>;
}
