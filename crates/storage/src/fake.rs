// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory `Database` for tests (behind `test-support`).

use crate::database::{DbError, Database};
use crate::records::{
    BuildMetricRow, BuildProductRow, BuildRow, BuildStepOutputRow, BuildStepRow, JobsetRow, NewBuild,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use qr_core::BuildStatus;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    next_build_id: i64,
    next_jobset_id: i64,
    jobsets: HashMap<i64, JobsetRow>,
    jobsets_by_name: HashMap<(String, String), i64>,
    builds: HashMap<i64, BuildRow>,
    steps: HashMap<(i64, i32), BuildStepRow>,
    step_outputs: HashMap<(i64, i32, String), BuildStepOutputRow>,
    products: HashMap<(i64, i32), BuildProductRow>,
    metrics: HashMap<(i64, String), BuildMetricRow>,
    failed_paths: HashSet<String>,
    system_status: HashMap<String, serde_json::Value>,
}

/// Single-process, mutex-guarded stand-in for [`crate::PostgresDatabase`].
/// Enough fidelity for the dispatcher/monitor/worker tests: assigns real
/// monotonic ids, round-trips every row, and enforces the same "don't
/// finish twice" guard.
#[derive(Default)]
pub struct FakeDatabase {
    inner: Mutex<Inner>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn get_or_create_jobset(&self, project: &str, name: &str) -> Result<JobsetRow, DbError> {
        let mut inner = self.inner.lock();
        let key = (project.to_string(), name.to_string());
        if let Some(&id) = inner.jobsets_by_name.get(&key) {
            return Ok(inner.jobsets[&id].clone());
        }
        inner.next_jobset_id += 1;
        let id = inner.next_jobset_id;
        let row = JobsetRow {
            id,
            project: project.to_string(),
            name: name.to_string(),
            enabled: true,
            scheduling_shares: 1,
            last_checked_time: None,
            trigger_time: None,
            check_interval: 300,
        };
        inner.jobsets.insert(id, row.clone());
        inner.jobsets_by_name.insert(key, id);
        Ok(row)
    }

    async fn set_jobset_shares(&self, jobset_id: i64, shares: i64) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let row = inner
            .jobsets
            .get_mut(&jobset_id)
            .ok_or(DbError::JobsetNotFound {
                project: String::new(),
                name: String::new(),
            })?;
        row.scheduling_shares = shares;
        Ok(())
    }

    async fn list_enabled_jobsets(&self) -> Result<Vec<JobsetRow>, DbError> {
        let inner = self.inner.lock();
        Ok(inner.jobsets.values().filter(|j| j.enabled).cloned().collect())
    }

    async fn queue_build(&self, build: NewBuild) -> Result<i64, DbError> {
        let mut inner = self.inner.lock();
        inner.next_build_id += 1;
        let id = inner.next_build_id;
        let row = BuildRow {
            id,
            jobset_id: build.jobset_id,
            job: build.job,
            drv_path: build.drv_path,
            maxsilent: build.maxsilent,
            timeout: build.timeout,
            timestamp: build.timestamp,
            global_priority: build.global_priority,
            priority: build.priority,
            finished: false,
            build_status: None,
            start_time: None,
            stop_time: None,
            size: None,
            closure_size: None,
            release_name: None,
            is_cached_build: false,
            notification_pending_since: None,
        };
        inner.builds.insert(id, row);
        Ok(id)
    }

    async fn get_build(&self, id: i64) -> Result<BuildRow, DbError> {
        self.inner.lock().builds.get(&id).cloned().ok_or(DbError::BuildNotFound(id))
    }

    async fn list_queued_builds(&self) -> Result<Vec<BuildRow>, DbError> {
        let inner = self.inner.lock();
        let mut rows: Vec<BuildRow> = inner.builds.values().filter(|b| !b.finished).cloned().collect();
        rows.sort_by_key(|b| b.id);
        Ok(rows)
    }

    async fn bump_build_priority(&self, id: i64, priority: i64) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let row = inner.builds.get_mut(&id).ok_or(DbError::BuildNotFound(id))?;
        row.priority = priority;
        Ok(())
    }

    async fn restart_build(&self, id: i64) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let row = inner.builds.get_mut(&id).ok_or(DbError::BuildNotFound(id))?;
        row.finished = false;
        row.build_status = None;
        Ok(())
    }

    async fn cancel_build(&self, id: i64) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let row = inner.builds.get_mut(&id).ok_or(DbError::BuildNotFound(id))?;
        row.finished = true;
        row.build_status = Some(BuildStatus::Cancelled.as_i32());
        Ok(())
    }

    async fn delete_build(&self, id: i64) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.builds.remove(&id).ok_or(DbError::BuildNotFound(id))?;
        Ok(())
    }

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
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        let row = inner.builds.get_mut(&id).ok_or(DbError::BuildNotFound(id))?;
        if row.finished {
            return Ok(());
        }
        row.finished = true;
        row.build_status = Some(status.as_i32());
        row.start_time = Some(start_time);
        row.stop_time = Some(stop_time);
        row.size = size;
        row.closure_size = closure_size;
        row.release_name = release_name;
        row.is_cached_build = is_cached_build;
        Ok(())
    }

    async fn upsert_build_step(&self, row: BuildStepRow) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.steps.insert((row.build, row.stepnr), row);
        Ok(())
    }

    async fn record_step_output(&self, row: BuildStepOutputRow) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner
            .step_outputs
            .insert((row.build, row.stepnr, row.name.clone()), row);
        Ok(())
    }

    async fn record_build_product(&self, row: BuildProductRow) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.products.insert((row.build, row.productnr), row);
        Ok(())
    }

    async fn record_build_metric(&self, row: BuildMetricRow) -> Result<(), DbError> {
        let mut inner = self.inner.lock();
        inner.metrics.insert((row.build, row.name.clone()), row);
        Ok(())
    }

    async fn is_known_failed_path(&self, path: &str) -> Result<bool, DbError> {
        Ok(self.inner.lock().failed_paths.contains(path))
    }

    async fn mark_path_failed(&self, path: &str) -> Result<(), DbError> {
        self.inner.lock().failed_paths.insert(path.to_string());
        Ok(())
    }

    async fn set_system_status(&self, what: &str, status: serde_json::Value) -> Result<(), DbError> {
        self.inner.lock().system_status.insert(what.to_string(), status);
        Ok(())
    }

    async fn get_system_status(&self, what: &str) -> Result<Option<serde_json::Value>, DbError> {
        Ok(self.inner.lock().system_status.get(what).cloned())
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
