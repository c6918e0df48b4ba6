// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sqlx`-backed `Database` adapter.

use crate::database::{DbError, Database};
use crate::records::{
    BuildMetricRow, BuildProductRow, BuildRow, BuildStepOutputRow, BuildStepRow, JobsetRow, NewBuild,
};
use async_trait::async_trait;
use qr_core::BuildStatus;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Postgres-backed implementation, connection-pooled to
/// `RunnerConfig::max_db_connections` (§6 "Database schema used").
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| DbError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), DbError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn get_or_create_jobset(&self, project: &str, name: &str) -> Result<JobsetRow, DbError> {
        let row = sqlx::query_as!(
            JobsetRow,
            r#"
            INSERT INTO jobsets (project, name)
            VALUES ($1, $2)
            ON CONFLICT (project, name) DO UPDATE SET project = EXCLUDED.project
            RETURNING id, project, name, enabled, scheduling_shares, last_checked_time, trigger_time, check_interval
            "#,
            project,
            name,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(row)
    }

    async fn set_jobset_shares(&self, jobset_id: i64, shares: i64) -> Result<(), DbError> {
        sqlx::query!("UPDATE jobsets SET scheduling_shares = $1 WHERE id = $2", shares, jobset_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "jobset_shares_changed", "").execute(&self.pool).await.ok();
        Ok(())
    }

    async fn list_enabled_jobsets(&self) -> Result<Vec<JobsetRow>, DbError> {
        let rows = sqlx::query_as!(
            JobsetRow,
            r#"
            SELECT id, project, name, enabled, scheduling_shares, last_checked_time, trigger_time, check_interval
            FROM jobsets WHERE enabled
            "#
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(rows)
    }

    async fn queue_build(&self, build: NewBuild) -> Result<i64, DbError> {
        let row = sqlx::query!(
            r#"
            INSERT INTO builds (jobset_id, job, drv_path, maxsilent, timeout, timestamp, global_priority, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
            build.jobset_id,
            build.job,
            build.drv_path,
            build.maxsilent,
            build.timeout,
            build.timestamp,
            build.global_priority,
            build.priority,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "builds_added", "").execute(&self.pool).await.ok();
        Ok(row.id)
    }

    async fn get_build(&self, id: i64) -> Result<BuildRow, DbError> {
        sqlx::query_as!(
            BuildRow,
            r#"
            SELECT id, jobset_id, job, drv_path, maxsilent, timeout, timestamp, global_priority,
                   priority, finished, build_status, start_time, stop_time, size, closure_size,
                   release_name, is_cached_build, notification_pending_since
            FROM builds WHERE id = $1
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?
        .ok_or(DbError::BuildNotFound(id))
    }

    async fn list_queued_builds(&self) -> Result<Vec<BuildRow>, DbError> {
        let rows = sqlx::query_as!(
            BuildRow,
            r#"
            SELECT id, jobset_id, job, drv_path, maxsilent, timeout, timestamp, global_priority,
                   priority, finished, build_status, start_time, stop_time, size, closure_size,
                   release_name, is_cached_build, notification_pending_since
            FROM builds WHERE NOT finished ORDER BY id
            "#
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(rows)
    }

    async fn bump_build_priority(&self, id: i64, priority: i64) -> Result<(), DbError> {
        sqlx::query!("UPDATE builds SET priority = $1 WHERE id = $2", priority, id)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "builds_bumped", "").execute(&self.pool).await.ok();
        Ok(())
    }

    async fn restart_build(&self, id: i64) -> Result<(), DbError> {
        sqlx::query!(
            "UPDATE builds SET finished = FALSE, build_status = NULL WHERE id = $1",
            id
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "builds_restarted", "").execute(&self.pool).await.ok();
        Ok(())
    }

    async fn cancel_build(&self, id: i64) -> Result<(), DbError> {
        sqlx::query!(
            "UPDATE builds SET finished = TRUE, build_status = $1 WHERE id = $2",
            BuildStatus::Cancelled.as_i32(),
            id
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "builds_cancelled", "").execute(&self.pool).await.ok();
        Ok(())
    }

    async fn delete_build(&self, id: i64) -> Result<(), DbError> {
        sqlx::query!("DELETE FROM builds WHERE id = $1", id)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "builds_deleted", "").execute(&self.pool).await.ok();
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
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
        let mut tx = self.pool.begin().await.map_err(|e| DbError::Query(e.to_string()))?;
        let updated = sqlx::query!(
            r#"
            UPDATE builds SET
                finished = TRUE,
                build_status = $2,
                start_time = $3,
                stop_time = $4,
                size = $5,
                closure_size = $6,
                release_name = $7,
                is_cached_build = $8
            WHERE id = $1 AND NOT finished
            "#,
            id,
            status.as_i32(),
            start_time,
            stop_time,
            size,
            closure_size,
            release_name,
            is_cached_build,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;

        if updated.rows_affected() == 0 {
            // Already finished (§4.3 "finishBuild must not run twice").
            tx.rollback().await.ok();
            return Ok(());
        }

        tx.commit().await.map_err(|e| DbError::Query(e.to_string()))?;
        sqlx::query!("SELECT pg_notify($1, $2)", "build_finished", id.to_string())
            .execute(&self.pool)
            .await
            .ok();
        Ok(())
    }

    async fn upsert_build_step(&self, row: BuildStepRow) -> Result<(), DbError> {
        sqlx::query!(
            r#"
            INSERT INTO build_steps
                (build, stepnr, type, drv_path, busy, start_time, stop_time, system, status,
                 propagated_from, error_msg, machine, overhead, times_built, is_non_deterministic)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (build, stepnr) DO UPDATE SET
                busy = EXCLUDED.busy,
                start_time = EXCLUDED.start_time,
                stop_time = EXCLUDED.stop_time,
                status = EXCLUDED.status,
                error_msg = EXCLUDED.error_msg,
                machine = EXCLUDED.machine,
                overhead = EXCLUDED.overhead,
                times_built = EXCLUDED.times_built,
                is_non_deterministic = EXCLUDED.is_non_deterministic
            "#,
            row.build,
            row.stepnr,
            row.step_type,
            row.drv_path,
            row.busy,
            row.start_time,
            row.stop_time,
            row.system,
            row.status,
            row.propagated_from,
            row.error_msg,
            row.machine,
            row.overhead,
            row.times_built,
            row.is_non_deterministic,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn record_step_output(&self, row: BuildStepOutputRow) -> Result<(), DbError> {
        sqlx::query!(
            r#"
            INSERT INTO build_step_outputs (build, stepnr, name, path)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (build, stepnr, name) DO NOTHING
            "#,
            row.build,
            row.stepnr,
            row.name,
            row.path,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn record_build_product(&self, row: BuildProductRow) -> Result<(), DbError> {
        sqlx::query!(
            r#"
            INSERT INTO build_products (build, productnr, type, subtype, file_size, sha256hash, path, name, default_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (build, productnr) DO NOTHING
            "#,
            row.build,
            row.productnr,
            row.product_type,
            row.subtype,
            row.file_size,
            row.sha256hash,
            row.path,
            row.name,
            row.default_path,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn record_build_metric(&self, row: BuildMetricRow) -> Result<(), DbError> {
        sqlx::query!(
            r#"
            INSERT INTO build_metrics (build, name, unit, value, project, jobset, job, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (build, name) DO UPDATE SET value = EXCLUDED.value
            "#,
            row.build,
            row.name,
            row.unit,
            row.value,
            row.project,
            row.jobset,
            row.job,
            row.timestamp,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn is_known_failed_path(&self, path: &str) -> Result<bool, DbError> {
        let row = sqlx::query!("SELECT 1 AS present FROM failed_paths WHERE path = $1", path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn mark_path_failed(&self, path: &str) -> Result<(), DbError> {
        sqlx::query!("INSERT INTO failed_paths (path) VALUES ($1) ON CONFLICT DO NOTHING", path)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn set_system_status(&self, what: &str, status: serde_json::Value) -> Result<(), DbError> {
        sqlx::query!(
            r#"
            INSERT INTO system_status (what, status) VALUES ($1, $2)
            ON CONFLICT (what) DO UPDATE SET status = EXCLUDED.status
            "#,
            what,
            status,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_system_status(&self, what: &str) -> Result<Option<serde_json::Value>, DbError> {
        let row = sqlx::query("SELECT status FROM system_status WHERE what = $1")
            .bind(what)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(row.map(|r| r.get::<serde_json::Value, _>("status")))
    }
}
