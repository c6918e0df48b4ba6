// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build outcomes (§7 "Error handling design").

use serde::{Deserialize, Serialize};

/// `BuildStatus` as stored in `Builds.buildStatus` / `BuildSteps.status`.
///
/// The numeric discriminants match the column values spec.md implies by
/// listing them in this order; callers should use the enum, not the number,
/// except at the database boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum BuildStatus {
    Success = 0,
    Failed = 1,
    DepFailed = 2,
    Aborted = 3,
    Cancelled = 4,
    FailedWithOutput = 5,
    TimedOut = 6,
    CachedFailure = 7,
    Unsupported = 8,
    LogLimitExceeded = 9,
    NarSizeLimitExceeded = 10,
    NotDeterministic = 11,
}

impl BuildStatus {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Success,
            1 => Self::Failed,
            2 => Self::DepFailed,
            3 => Self::Aborted,
            4 => Self::Cancelled,
            5 => Self::FailedWithOutput,
            6 => Self::TimedOut,
            7 => Self::CachedFailure,
            8 => Self::Unsupported,
            9 => Self::LogLimitExceeded,
            10 => Self::NarSizeLimitExceeded,
            11 => Self::NotDeterministic,
            _ => return None,
        })
    }

    /// Whether a step ending in this status should be retried (§7 table).
    pub fn can_retry(self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Whether outputs produced under this status may be cached /
    /// substituted for future builds (§7 table).
    pub fn can_cache(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::FailedWithOutput | Self::NotDeterministic
        )
    }

    /// Whether the originating build (as opposed to its dependents) is the
    /// one that should be marked with this status, versus `DepFailed`.
    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            Self::Failed
                | Self::Aborted
                | Self::Cancelled
                | Self::TimedOut
                | Self::Unsupported
                | Self::LogLimitExceeded
                | Self::NarSizeLimitExceeded
                | Self::NotDeterministic
        )
    }
}

/// The per-attempt outcome produced by a Builder Worker (§3 "Remote
/// Result").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResult {
    pub status: BuildStatus,
    pub error_msg: Option<String>,
    pub start_time: u64,
    pub stop_time: u64,
    pub log_file: Option<String>,
    pub can_cache: bool,
    pub can_retry: bool,
    pub is_cached: bool,
    pub is_non_deterministic: bool,
    pub times_built: u32,
    /// True if the build succeeded but declared itself failed via
    /// `$out/nix-support/failed` (§6 "Artifact files").
    pub failed_with_output: bool,
    /// Populated once outputs have been imported (§3 "Build Output").
    pub output: Option<BuildOutput>,
}

impl RemoteResult {
    pub fn new(status: BuildStatus, start_time: u64, stop_time: u64) -> Self {
        Self {
            can_cache: status.can_cache(),
            can_retry: status.can_retry(),
            status,
            error_msg: None,
            start_time,
            stop_time,
            log_file: None,
            is_cached: false,
            is_non_deterministic: false,
            times_built: 1,
            failed_with_output: false,
            output: None,
        }
    }

    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }
}

/// One build product declared in `$out/nix-support/hydra-build-products`
/// (§6 "Artifact files").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildProduct {
    pub product_type: String,
    pub subtype: String,
    pub file_size: Option<u64>,
    pub sha256_hash: Option<String>,
    pub path: String,
    pub name: String,
    pub default_path: String,
}

/// One metric declared in `$out/nix-support/hydra-metrics` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetric {
    pub name: String,
    pub unit: Option<String>,
    pub value: f64,
}

/// Post-success digest persisted once all outputs have been imported
/// (§3 "Build Output").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    pub nar_size: u64,
    pub closure_size: u64,
    pub release_name: Option<String>,
    pub products: Vec<BuildProduct>,
    pub metrics: Vec<BuildMetric>,
    pub failed_with_output: bool,
}

#[cfg(test)]
#[path = "result_tests.rs"]
mod tests;
