// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner configuration (§6 "Configuration").

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_max_unsupported_time() -> u64 {
    24 * 60 * 60
}

fn default_max_db_connections() -> u32 {
    128
}

fn default_max_output_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_log_size() -> u64 {
    64 * 1024 * 1024
}

fn default_max_tries() -> u32 {
    5
}

fn default_retry_interval_secs() -> u64 {
    60
}

fn default_retry_backoff() -> f64 {
    3.0
}

fn default_max_parallel_copy_closure() -> u32 {
    4
}

fn default_evaluator_workers() -> u32 {
    4
}

fn default_evaluator_max_memory_size() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_gc_roots_dir() -> PathBuf {
    PathBuf::from("/nix/var/nix/gcroots/per-build")
}

fn default_memory_tokens_total() -> u64 {
    1024 * 1024 * 1024
}

/// A `project:jobset:N` triple forcing N-repeat determinism checking
/// (§6 "xxx-jobset-repeats").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsetRepeat {
    pub project: String,
    pub jobset: String,
    pub repeats: u32,
}

impl std::str::FromStr for JobsetRepeat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        let [project, jobset, repeats] = parts.as_slice() else {
            return Err(CoreError::InvalidConfig(format!(
                "jobset-repeats entry must be project:jobset:N, got {s:?}"
            )));
        };
        let repeats: u32 = repeats
            .parse()
            .map_err(|_| CoreError::InvalidConfig(format!("invalid repeat count in {s:?}")))?;
        Ok(Self {
            project: project.to_string(),
            jobset: jobset.to_string(),
            repeats,
        })
    }
}

/// Runner-wide configuration (§6 "Configuration (key: effect)"), loaded
/// from TOML with these defaults for anything the operator doesn't set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    #[serde(default = "default_max_unsupported_time")]
    pub max_unsupported_time: u64,
    #[serde(default = "default_max_db_connections")]
    pub max_db_connections: u32,
    #[serde(default = "default_max_output_size")]
    pub max_output_size: u64,
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    pub upload_logs_to_binary_cache: bool,
    #[serde(default = "default_gc_roots_dir")]
    pub gc_roots_dir: PathBuf,
    pub store_uri: String,
    pub use_substitutes: bool,
    pub jobset_repeats: Vec<JobsetRepeat>,
    #[serde(default = "default_evaluator_workers")]
    pub evaluator_workers: u32,
    #[serde(default = "default_evaluator_max_memory_size")]
    pub evaluator_max_memory_size: u64,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    #[serde(default = "default_max_parallel_copy_closure")]
    pub max_parallel_copy_closure: u32,
    /// Ceiling (bytes) for the counted semaphore bounding concurrent output
    /// imports (§5 "a counted semaphore with a fixed ceiling, configurable").
    #[serde(default = "default_memory_tokens_total")]
    pub memory_tokens_total: u64,
    pub database_url: String,
    pub machines_file: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_unsupported_time: default_max_unsupported_time(),
            max_db_connections: default_max_db_connections(),
            max_output_size: default_max_output_size(),
            max_log_size: default_max_log_size(),
            upload_logs_to_binary_cache: false,
            gc_roots_dir: default_gc_roots_dir(),
            store_uri: String::new(),
            use_substitutes: true,
            jobset_repeats: Vec::new(),
            evaluator_workers: default_evaluator_workers(),
            evaluator_max_memory_size: default_evaluator_max_memory_size(),
            max_tries: default_max_tries(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_backoff: default_retry_backoff(),
            max_parallel_copy_closure: default_max_parallel_copy_closure(),
            memory_tokens_total: default_memory_tokens_total(),
            database_url: "postgres://localhost/qr".to_string(),
            machines_file: PathBuf::from("/etc/nix/machines"),
        }
    }
}

impl RunnerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, CoreError> {
        toml::from_str(s).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidConfig(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_db_connections == 0 {
            return Err(CoreError::InvalidConfig("max_db_connections must be nonzero".into()));
        }
        if self.retry_backoff < 1.0 {
            return Err(CoreError::InvalidConfig("retry_backoff must be >= 1.0".into()));
        }
        if self.evaluator_workers == 0 {
            return Err(CoreError::InvalidConfig("evaluator_workers must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
