// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Structured logging setup (§4.7): `RUST_LOG`-style env-filter driven
//! `tracing-subscriber`, writing to a rotation-free log file plus stdout
//! when one is configured.

use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global `tracing` subscriber. When `log_path` is `None`,
/// everything goes to stdout, which is how tests and `qr --foreground`
/// runs want it; a real daemon invocation passes a log file path.
pub fn init(log_path: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("qrd.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(non_blocking))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
            Ok(None)
        }
    }
}
