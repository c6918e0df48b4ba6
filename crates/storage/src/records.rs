// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Row shapes for the tables in §6 "Database schema used".
//!
//! These mirror the columns verbatim rather than the in-memory
//! `qr_core::{Build, Step, Jobset, Machine}` graph nodes: a row is a flat,
//! serializable snapshot fit for a SQL round trip, while the graph nodes
//! carry `Arc`/`Weak`/`Mutex` structure that has no business touching the
//! database.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsetRow {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub enabled: bool,
    pub scheduling_shares: i64,
    pub last_checked_time: Option<i64>,
    pub trigger_time: Option<i64>,
    pub check_interval: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRow {
    pub id: i64,
    pub jobset_id: i64,
    pub job: String,
    pub drv_path: String,
    pub maxsilent: i64,
    pub timeout: i64,
    pub timestamp: i64,
    pub global_priority: i64,
    pub priority: i64,
    pub finished: bool,
    pub build_status: Option<i32>,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub size: Option<i64>,
    pub closure_size: Option<i64>,
    pub release_name: Option<String>,
    pub is_cached_build: bool,
    pub notification_pending_since: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuild {
    pub jobset_id: i64,
    pub job: String,
    pub drv_path: String,
    pub maxsilent: i64,
    pub timeout: i64,
    pub timestamp: i64,
    pub global_priority: i64,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStepRow {
    pub build: i64,
    pub stepnr: i32,
    pub step_type: i32,
    pub drv_path: String,
    pub busy: bool,
    pub start_time: Option<i64>,
    pub stop_time: Option<i64>,
    pub system: Option<String>,
    pub status: Option<i32>,
    pub propagated_from: Option<i64>,
    pub error_msg: Option<String>,
    pub machine: Option<String>,
    pub overhead: Option<i64>,
    pub times_built: i32,
    pub is_non_deterministic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStepOutputRow {
    pub build: i64,
    pub stepnr: i32,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildProductRow {
    pub build: i64,
    pub productnr: i32,
    pub product_type: String,
    pub subtype: String,
    pub file_size: Option<i64>,
    pub sha256hash: Option<String>,
    pub path: Option<String>,
    pub name: Option<String>,
    pub default_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetricRow {
    pub build: i64,
    pub name: String,
    pub unit: Option<String>,
    pub value: f64,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub timestamp: i64,
}
