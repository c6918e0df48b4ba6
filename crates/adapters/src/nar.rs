// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NAR (Nix Archive) streaming, as a pull interface over whatever byte
//! stream `cmdImportPaths`/`cmdExportPaths` are moving (§6 "Remote build
//! wire protocol": `cmdImportPaths(stream)`).
//!
//! The store itself stays opaque per the domain model (§3 "Non-goals":
//! deriving's on-disk ATerm format is not parsed) — this module only
//! streams the archive container format, not its contents' meaning.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const NAR_MAGIC: &str = "nix-archive-1";

#[derive(Debug, Error)]
pub enum NarError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a NAR stream: bad magic")]
    BadMagic,
    #[error("malformed NAR: {0}")]
    Malformed(String),
}

fn padded_len(len: usize) -> usize {
    (len + 7) / 8 * 8
}

async fn read_nar_string(r: &mut (impl AsyncRead + Unpin)) -> Result<String, NarError> {
    let mut len_buf = [0u8; 8];
    r.read_exact(&mut len_buf).await?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).await?;
    let pad = padded_len(len) - len;
    if pad > 0 {
        let mut discard = vec![0u8; pad];
        r.read_exact(&mut discard).await?;
    }
    String::from_utf8(bytes).map_err(|e| NarError::Malformed(e.to_string()))
}

async fn write_nar_string(w: &mut (impl AsyncWrite + Unpin), s: &str) -> Result<(), NarError> {
    let bytes = s.as_bytes();
    w.write_all(&(bytes.len() as u64).to_le_bytes()).await?;
    w.write_all(bytes).await?;
    let pad = padded_len(bytes.len()) - bytes.len();
    if pad > 0 {
        w.write_all(&vec![0u8; pad]).await?;
    }
    Ok(())
}

/// Verifies the 13-byte `nix-archive-1` magic string that opens every NAR.
pub async fn read_magic(r: &mut (impl AsyncRead + Unpin)) -> Result<(), NarError> {
    let magic = read_nar_string(r).await?;
    if magic != NAR_MAGIC {
        return Err(NarError::BadMagic);
    }
    Ok(())
}

pub async fn write_magic(w: &mut (impl AsyncWrite + Unpin)) -> Result<(), NarError> {
    write_nar_string(w, NAR_MAGIC).await
}

/// Streams a single regular file's contents from `r` to `sink`, without
/// materializing the whole file in memory. `size` must be the declared
/// file size (already read from the NAR header).
pub async fn copy_file_contents(
    r: &mut (impl AsyncRead + Unpin),
    sink: &mut (impl AsyncWrite + Unpin),
    size: u64,
) -> Result<(), NarError> {
    let mut remaining = size;
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..chunk]).await?;
        sink.write_all(&buf[..chunk]).await?;
        remaining -= chunk as u64;
    }
    let pad = padded_len(size as usize) - size as usize;
    if pad > 0 {
        let mut discard = vec![0u8; pad];
        r.read_exact(&mut discard).await?;
    }
    Ok(())
}

/// `sha256(nar bytes)` as a lowercase hex string, matching the `narHash`
/// field `cmdQueryPathInfos` reports (§6).
pub fn hash_nar(nar_bytes: &[u8]) -> String {
    let digest = Sha256::digest(nar_bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[path = "nar_tests.rs"]
mod tests;
