// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Errors surfaced by the queue runner's in-process orchestration.
//!
//! Port-level errors (`DbError`, `StoreError`, `TransportError`,
//! `ProtocolError`, `DerivationStoreError`) are wrapped here rather than
//! flattened, so a caller can still match on the underlying adapter
//! failure.

use crate::evaluator::EvaluatorError;
use qr_adapters::{DerivationStoreError, ProtocolError, StoreError, TransportError};
use qr_storage::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("derivation store error: {0}")]
    DerivationStore(#[from] DerivationStoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("machine {0} has no free slot")]
    NoFreeSlot(String),
    #[error("step {0} is not runnable")]
    StepNotRunnable(String),
    #[error("dispatched attempt task panicked: {0}")]
    TaskJoin(String),
    #[error("machines file error: {0}")]
    MachinesFile(String),
    #[error("evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_wraps_source_message() {
        let err = EngineError::NoFreeSlot("builder1".to_string());
        assert_eq!(err.to_string(), "machine builder1 has no free slot");
    }
}
