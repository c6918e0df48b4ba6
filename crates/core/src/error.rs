// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the domain model.

use thiserror::Error;

/// Errors that can occur while building or mutating the domain model.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("derivation not found: {0}")]
    DerivationNotFound(String),
    #[error("step not found: {0}")]
    StepNotFound(String),
    #[error("build not found: {0}")]
    BuildNotFound(i64),
    #[error("jobset not found: {0}")]
    JobsetNotFound(String),
    #[error("machine not found: {0}")]
    MachineNotFound(String),
    #[error("invalid derivation {path}: {message}")]
    InvalidDerivation { path: String, message: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid machines file entry on line {line}: {message}")]
    InvalidMachinesEntry { line: usize, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_identifying_detail() {
        let err = CoreError::BuildNotFound(42);
        assert_eq!(err.to_string(), "build not found: 42");

        let err = CoreError::InvalidDerivation {
            path: "/a.drv".into(),
            message: "missing system".into(),
        };
        assert_eq!(err.to_string(), "invalid derivation /a.drv: missing system");
    }
}
