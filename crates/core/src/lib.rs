// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! qr-core: domain model for the queue runner and evaluator worker pool.
//!
//! This crate owns the data shapes described in the spec's data model
//! (builds, steps, jobsets, machines, derivations, remote results) plus the
//! small set of cross-cutting abstractions (ids, clock, config, errors,
//! notification events) that every other crate in the workspace builds on.

pub mod build;
pub mod clock;
pub mod config;
pub mod derivation;
pub mod error;
pub mod event;
pub mod ids;
pub mod jobset;
pub mod machine;
pub mod result;
pub mod step;

pub use build::Build;
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::RunnerConfig;
pub use derivation::{BasicDerivation, Derivation, DerivationOutput};
pub use error::CoreError;
pub use event::Event;
pub use ids::{BuildId, DrvPath, IdGen, MachineName, SequentialIdGen, ShortId, StorePath, TimerId, UuidIdGen};
pub use jobset::{Jobset, JobsetKey, JobsetName};
pub use machine::{ConnectState, Machine};
pub use result::{BuildOutput, BuildProduct, BuildStatus, BuildMetric, RemoteResult};
pub use step::{Step, StepState, StepStatus};
