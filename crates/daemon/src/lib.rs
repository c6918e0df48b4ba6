// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Queue runner daemon (`qrd`): wires the ports in `qr-adapters`/
//! `qr-storage` to `qr_engine::Runtime` and runs it to completion.

pub mod logging;
pub mod wiring;

pub use wiring::{build_runtime, DaemonError};
