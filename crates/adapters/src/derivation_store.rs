// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `DerivationStore` port: reads and parses `.drv` files (§3
//! "Derivation model"). The on-disk ATerm-like format itself stays opaque
//! per the domain model; this adapter only shells out to `nix` and
//! reinterprets its JSON, never hand-rolling the serialization.

use async_trait::async_trait;
use qr_core::{BasicDerivation, DerivationOutput, DrvPath, StorePath};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DerivationStoreError {
    #[error("derivation not found: {0}")]
    NotFound(String),
    #[error("malformed derivation json: {0}")]
    Malformed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads a parsed [`BasicDerivation`] given its store path (§3 "Derivation
/// model", §4.1 step 2: "read and parse the derivation").
#[async_trait]
pub trait DerivationStore: Send + Sync + 'static {
    async fn read_derivation(&self, path: &DrvPath) -> Result<BasicDerivation, DerivationStoreError>;

    /// Writes a derivation to the store and returns the `.drv` path Nix
    /// assigns it, content-addressed on the derivation's own fields (§4.5
    /// aggregate job rewrite: extending `inputDrvs` changes the derivation's
    /// hash, which changes its store path).
    async fn write_derivation(&self, derivation: &BasicDerivation) -> Result<DrvPath, DerivationStoreError>;
}

/// Shells out to `nix derivation show`, which already reinterprets the
/// on-disk ATerm format as JSON — we never parse that format ourselves.
#[derive(Clone, Copy, Default)]
pub struct LocalDerivationStore;

impl LocalDerivationStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DerivationStore for LocalDerivationStore {
    async fn read_derivation(&self, path: &DrvPath) -> Result<BasicDerivation, DerivationStoreError> {
        let output = tokio::process::Command::new("nix")
            .args(["derivation", "show", path.as_str()])
            .output()
            .await?;
        if !output.status.success() {
            return Err(DerivationStoreError::NotFound(path.as_str().to_string()));
        }
        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| DerivationStoreError::Malformed(e.to_string()))?;
        let entry = json
            .get(path.as_str())
            .ok_or_else(|| DerivationStoreError::Malformed("missing top-level key".into()))?;
        parse_entry(entry)
    }

    async fn write_derivation(&self, derivation: &BasicDerivation) -> Result<DrvPath, DerivationStoreError> {
        use tokio::io::AsyncWriteExt;

        let json = entry_to_json(derivation);
        let body = serde_json::to_vec(&json).map_err(|e| DerivationStoreError::Malformed(e.to_string()))?;

        let mut child = tokio::process::Command::new("nix")
            .args(["derivation", "add"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()?;
        let mut stdin = child.stdin.take().ok_or_else(|| DerivationStoreError::Malformed("no stdin".into()))?;
        stdin.write_all(&body).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(DerivationStoreError::Malformed("nix derivation add failed".into()));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(DrvPath::new(path))
    }
}

/// Inverse of [`parse_entry`]: the JSON body `nix derivation add` expects on
/// its stdin, folding `requiredSystemFeatures`/`preferLocalBuild`/
/// `__contentAddressed` back into `env` the way Nix itself stores them.
fn entry_to_json(derivation: &BasicDerivation) -> serde_json::Value {
    let mut env = serde_json::Map::new();
    for (k, v) in &derivation.env {
        env.insert(k.clone(), serde_json::Value::String(v.clone()));
    }
    if !derivation.required_features.is_empty() {
        let joined = derivation.required_features.iter().cloned().collect::<Vec<_>>().join(" ");
        env.insert("requiredSystemFeatures".to_string(), serde_json::Value::String(joined));
    }
    if derivation.prefer_local_build {
        env.insert("preferLocalBuild".to_string(), serde_json::Value::String("1".to_string()));
    }
    if derivation.is_deterministic {
        env.insert("__contentAddressed".to_string(), serde_json::Value::String("1".to_string()));
    }

    let input_drvs: serde_json::Map<String, serde_json::Value> = derivation
        .input_drvs
        .iter()
        .map(|(path, outputs)| {
            let outputs = outputs.iter().cloned().map(serde_json::Value::String).collect();
            (path.as_str().to_string(), serde_json::Value::Array(outputs))
        })
        .collect();

    let outputs: serde_json::Map<String, serde_json::Value> = derivation
        .outputs
        .iter()
        .map(|output| {
            let mut entry = serde_json::Map::new();
            if let Some(path) = &output.path {
                entry.insert("path".to_string(), serde_json::Value::String(path.as_str().to_string()));
            }
            (output.name.clone(), serde_json::Value::Object(entry))
        })
        .collect();

    serde_json::json!({
        "builder": derivation.builder,
        "system": derivation.system,
        "args": derivation.args,
        "env": env,
        "inputSrcs": derivation.input_srcs.iter().map(|p| p.as_str().to_string()).collect::<Vec<_>>(),
        "inputDrvs": input_drvs,
        "outputs": outputs,
    })
}

fn parse_entry(entry: &serde_json::Value) -> Result<BasicDerivation, DerivationStoreError> {
    let malformed = |msg: &str| DerivationStoreError::Malformed(msg.to_string());

    let builder = entry
        .get("builder")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("missing builder"))?
        .to_string();
    let system = entry
        .get("system")
        .and_then(|v| v.as_str())
        .ok_or_else(|| malformed("missing system"))?
        .to_string();
    let args = entry
        .get("args")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let env: BTreeMap<String, String> = entry
        .get("env")
        .and_then(|v| v.as_object())
        .map(|o| {
            o.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let input_srcs: BTreeSet<StorePath> = entry
        .get("inputSrcs")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).map(StorePath::new).collect())
        .unwrap_or_default();
    let input_drvs: BTreeMap<DrvPath, BTreeSet<String>> = entry
        .get("inputDrvs")
        .and_then(|v| v.as_object())
        .map(|o| {
            o.iter()
                .map(|(k, v)| {
                    let outputs = v
                        .as_array()
                        .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    (DrvPath::new(k.clone()), outputs)
                })
                .collect()
        })
        .unwrap_or_default();
    let outputs = entry
        .get("outputs")
        .and_then(|v| v.as_object())
        .map(|o| {
            o.iter()
                .map(|(name, v)| DerivationOutput {
                    name: name.clone(),
                    path: v.get("path").and_then(|p| p.as_str()).map(StorePath::new),
                })
                .collect()
        })
        .unwrap_or_default();
    let required_features = entry
        .get("env")
        .and_then(|v| v.get("requiredSystemFeatures"))
        .and_then(|v| v.as_str())
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default();
    let prefer_local_build = entry
        .get("env")
        .and_then(|v| v.get("preferLocalBuild"))
        .and_then(|v| v.as_str())
        .map(|s| s == "1")
        .unwrap_or(false);
    let is_deterministic = entry
        .get("env")
        .and_then(|v| v.get("__contentAddressed"))
        .and_then(|v| v.as_str())
        .map(|s| s == "1")
        .unwrap_or(false);

    Ok(BasicDerivation {
        builder,
        args,
        env,
        input_srcs,
        input_drvs,
        outputs,
        system,
        required_features,
        is_deterministic,
        prefer_local_build,
    })
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// In-memory stand-in seeded with whole derivation bodies, for tests
    /// that want to drive the Step Graph without a real Nix store.
    #[derive(Clone, Default)]
    pub struct FakeDerivationStore {
        derivations: Arc<Mutex<HashMap<DrvPath, BasicDerivation>>>,
    }

    impl FakeDerivationStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, path: DrvPath, derivation: BasicDerivation) {
            self.derivations.lock().insert(path, derivation);
        }
    }

    #[async_trait]
    impl DerivationStore for FakeDerivationStore {
        async fn read_derivation(&self, path: &DrvPath) -> Result<BasicDerivation, DerivationStoreError> {
            self.derivations
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| DerivationStoreError::NotFound(path.as_str().to_string()))
        }

        async fn write_derivation(&self, derivation: &BasicDerivation) -> Result<DrvPath, DerivationStoreError> {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};

            let mut hasher = DefaultHasher::new();
            derivation.builder.hash(&mut hasher);
            derivation.system.hash(&mut hasher);
            for (path, outputs) in &derivation.input_drvs {
                path.as_str().hash(&mut hasher);
                for output in outputs {
                    output.hash(&mut hasher);
                }
            }
            let path = DrvPath::new(format!("/nix/store/{:016x}-aggregate.drv", hasher.finish()));
            self.derivations.lock().insert(path.clone(), derivation.clone());
            Ok(path)
        }
    }
}

#[cfg(test)]
#[path = "derivation_store_tests.rs"]
mod tests;
