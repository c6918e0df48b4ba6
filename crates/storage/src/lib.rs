// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storage layer for the queue runner: the `Database` and `Notifier` ports,
//! a `sqlx`/Postgres implementation of each, and the row shapes of §6
//! "Database schema used".
//!
//! Durability lives entirely in the external database (§6): unlike a
//! process that owns its own on-disk log, there is no local WAL or
//! snapshot here — crash recovery means reconnecting and re-reading the
//! tables below, not replaying anything this crate wrote.

pub mod database;
mod notify;
pub mod postgres;
pub mod records;

pub use database::{DbError, Database};
pub use notify::{Notifier, NotifyError, PostgresNotifier};
pub use postgres::PostgresDatabase;

#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeDatabase;
#[cfg(any(test, feature = "test-support"))]
pub use notify::FakeNotifier;
