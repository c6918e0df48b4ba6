// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `nix-store --serve` wire protocol spoken with remote builders
//! (§6 "Remote build wire protocol").
//!
//! Integers are little-endian, padded to 8-byte boundaries; strings are a
//! `u64` length followed by the bytes, padded the same way.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SERVE_MAGIC_1: u64 = 0x390c9deb;
pub const SERVE_MAGIC_2: u64 = 0x5452eecb;
/// Protocol version this client speaks: major 2, minor 3 (determinism
/// fields, §6 "minor-version-gated features").
pub const CLIENT_VERSION: u64 = 0x203;

pub mod commands {
    pub const QUERY_VALID_PATHS: u64 = 1;
    pub const QUERY_PATH_INFOS: u64 = 5;
    pub const IMPORT_PATHS: u64 = 6;
    pub const EXPORT_PATHS: u64 = 7;
    pub const BUILD_PATHS: u64 = 2;
    pub const BUILD_DERIVATION: u64 = 9;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic: expected {expected:#x}, got {got:#x}")]
    BadMagic { expected: u64, got: u64 },
    #[error("remote version {0:#x} too old, cmdBuildDerivation requires minor >= 1")]
    RemoteTooOld(u64),
    #[error("string too long: {0} bytes")]
    StringTooLong(usize),
}

fn minor(version: u64) -> u64 {
    version & 0xff
}

pub fn major(version: u64) -> u64 {
    version >> 8
}

/// `≥1` accepts `cmdBuildDerivation`.
pub fn supports_build_derivation(remote_version: u64) -> bool {
    minor(remote_version) >= 1
}

/// `≥2` accepts the `maxLogSize` argument to `cmdBuildDerivation`.
pub fn supports_max_log_size(remote_version: u64) -> bool {
    minor(remote_version) >= 2
}

/// `≥3` accepts repeat/determinism-checking fields and returns the
/// corresponding result fields.
pub fn supports_repeats(remote_version: u64) -> bool {
    minor(remote_version) >= 3
}

pub async fn write_u64(w: &mut (impl AsyncWrite + Unpin), v: u64) -> Result<(), ProtocolError> {
    w.write_all(&v.to_le_bytes()).await?;
    Ok(())
}

pub async fn read_u64(r: &mut (impl AsyncRead + Unpin)) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

fn padded_len(len: usize) -> usize {
    (len + 7) / 8 * 8
}

pub async fn write_string(w: &mut (impl AsyncWrite + Unpin), s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    write_u64(w, bytes.len() as u64).await?;
    w.write_all(bytes).await?;
    let pad = padded_len(bytes.len()) - bytes.len();
    if pad > 0 {
        w.write_all(&[0u8; 8][..pad]).await?;
    }
    Ok(())
}

pub async fn read_string(r: &mut (impl AsyncRead + Unpin)) -> Result<String, ProtocolError> {
    let len = read_u64(r).await? as usize;
    if len > 64 * 1024 * 1024 {
        return Err(ProtocolError::StringTooLong(len));
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    let pad = padded_len(len) - len;
    if pad > 0 {
        let mut discard = [0u8; 8];
        r.read_exact(&mut discard[..pad]).await?;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn write_string_list(
    w: &mut (impl AsyncWrite + Unpin),
    items: &[String],
) -> Result<(), ProtocolError> {
    write_u64(w, items.len() as u64).await?;
    for item in items {
        write_string(w, item).await?;
    }
    Ok(())
}

pub async fn read_string_list(r: &mut (impl AsyncRead + Unpin)) -> Result<Vec<String>, ProtocolError> {
    let n = read_u64(r).await?;
    let mut items = Vec::with_capacity(n as usize);
    for _ in 0..n {
        items.push(read_string(r).await?);
    }
    Ok(items)
}

/// Performs the client side of the handshake: write `SERVE_MAGIC_1 |
/// clientVersion`, read `SERVE_MAGIC_2 | remoteVersion` (§6 "Handshake").
pub async fn handshake(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
) -> Result<u64, ProtocolError> {
    write_u64(stream, SERVE_MAGIC_1).await?;
    write_u64(stream, CLIENT_VERSION).await?;
    stream.flush().await?;

    let magic = read_u64(stream).await?;
    if magic != SERVE_MAGIC_2 {
        return Err(ProtocolError::BadMagic {
            expected: SERVE_MAGIC_2,
            got: magic,
        });
    }
    let remote_version = read_u64(stream).await?;
    if !supports_build_derivation(remote_version) {
        return Err(ProtocolError::RemoteTooOld(remote_version));
    }
    Ok(remote_version)
}

/// The wire shape of `cmdBuildDerivation`'s request: the drv path plus the
/// flattened fields of its body (§6 "Remote build wire protocol").
pub struct BuildDerivationRequest<'a> {
    pub drv_path: &'a str,
    pub outputs: &'a [String],
    pub platform: &'a str,
    pub builder: &'a str,
    pub args: &'a [String],
    pub env: &'a [(String, String)],
    pub max_silent_time: u64,
    pub build_timeout: u64,
    pub max_log_size: u64,
}

/// The wire shape of `cmdBuildDerivation`'s response.
#[derive(Debug, Clone)]
pub struct BuildDerivationResult {
    pub status: u64,
    pub error_msg: String,
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
}

/// Sends `cmdBuildDerivation` and reads back its result, gating the
/// minor-version-dependent fields per `supports_max_log_size`/
/// `supports_repeats` (§6 "minor-version-gated features").
pub async fn send_build_derivation(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
    remote_version: u64,
    req: &BuildDerivationRequest<'_>,
) -> Result<BuildDerivationResult, ProtocolError> {
    write_u64(stream, commands::BUILD_DERIVATION).await?;
    write_string(stream, req.drv_path).await?;
    write_string(stream, req.platform).await?;
    write_string(stream, req.builder).await?;
    write_string(stream, &req.args.join(" ")).await?;
    write_u64(stream, req.env.len() as u64).await?;
    for (k, v) in req.env {
        write_string(stream, k).await?;
        write_string(stream, v).await?;
    }
    write_string_list(stream, req.outputs).await?;
    write_u64(stream, req.max_silent_time).await?;
    write_u64(stream, req.build_timeout).await?;
    if supports_max_log_size(remote_version) {
        write_u64(stream, req.max_log_size).await?;
    }
    stream.flush().await?;

    let status = read_u64(stream).await?;
    let error_msg = read_string(stream).await?;
    let (times_built, is_non_deterministic, start_time, stop_time) = if supports_repeats(remote_version) {
        let times_built = read_u64(stream).await?;
        let is_non_deterministic = read_u64(stream).await? != 0;
        let start_time = read_u64(stream).await?;
        let stop_time = read_u64(stream).await?;
        (times_built, is_non_deterministic, start_time, stop_time)
    } else {
        (1, false, 0, 0)
    };

    Ok(BuildDerivationResult {
        status,
        error_msg,
        times_built,
        is_non_deterministic,
        start_time,
        stop_time,
    })
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
