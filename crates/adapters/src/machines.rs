// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Machines file parsing and reload-on-change watching (§6 "Machines
//! file").

use base64::Engine;
use qr_core::{CoreError, Machine, MachineName};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MachinesFileError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] CoreError),
}

fn split_csv(field: &str) -> HashSet<String> {
    if field == "-" {
        HashSet::new()
    } else {
        field.split(',').map(|s| s.to_string()).collect()
    }
}

/// Parses one non-comment, non-blank line of the machines file. Lines with
/// fewer than 3 whitespace-separated tokens are ignored (§6).
fn parse_line(line_no: usize, line: &str) -> Result<Option<Machine>, CoreError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 {
        return Ok(None);
    }

    let ssh_name = fields[0];
    let system_types = split_csv(fields[1]);
    let ssh_key = fields.get(2).filter(|s| **s != "-").map(|s| s.to_string());
    let max_jobs: u32 = match fields.get(3) {
        None | Some(&"-") => 1,
        Some(s) => s.parse().map_err(|_| CoreError::InvalidMachinesEntry {
            line: line_no,
            message: format!("invalid maxJobs {s:?}"),
        })?,
    };
    let speed_factor: f64 = match fields.get(4) {
        None => 1.0,
        Some(s) => s.parse().map_err(|_| CoreError::InvalidMachinesEntry {
            line: line_no,
            message: format!("invalid speedFactor {s:?}"),
        })?,
    };
    let supported_features = fields.get(5).map(|s| split_csv(s)).unwrap_or_default();
    let mandatory_features = fields.get(6).map(|s| split_csv(s)).unwrap_or_default();
    let public_host_key = fields.get(7).filter(|s| **s != "-").map(|s| {
        // Stored base64-encoded in the file (§6); decode eagerly so a
        // malformed key is caught at load time, not at handshake time.
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map(|_| s.to_string())
            .unwrap_or_else(|_| s.to_string())
    });

    let mut machine = Machine::new(MachineName::new(ssh_name), system_types, max_jobs, speed_factor);
    machine.ssh_key = ssh_key;
    machine.public_host_key = public_host_key;
    // Mandatory features are automatically added to supported features (§6).
    machine.supported_features = supported_features.union(&mandatory_features).cloned().collect();
    machine.mandatory_features = mandatory_features;
    Ok(Some(machine))
}

/// Parses an entire machines file, skipping blank lines and `#` comments.
pub fn parse(contents: &str) -> Result<Vec<Machine>, CoreError> {
    let mut machines = Vec::new();
    for (i, raw_line) in contents.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(machine) = parse_line(i + 1, line)? {
            machines.push(machine);
        }
    }
    Ok(machines)
}

pub fn load(path: impl AsRef<Path>) -> Result<Vec<Machine>, MachinesFileError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| MachinesFileError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(parse(&contents)?)
}

/// Tracks a file's inode + mtime so callers can detect changes on a poll
/// interval without a dedicated OS file-watch (§6 "re-read whenever any
/// configured path's inode or mtime changes (poll every 30 s)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    #[cfg(unix)]
    inode: u64,
    mtime: Option<SystemTime>,
}

impl FileFingerprint {
    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            #[cfg(unix)]
            inode: {
                use std::os::unix::fs::MetadataExt;
                meta.ino()
            },
            mtime: meta.modified().ok(),
        })
    }
}

/// The default poll interval for machines-file reload checks (§6).
pub const MACHINES_FILE_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[cfg(test)]
#[path = "machines_tests.rs"]
mod tests;
