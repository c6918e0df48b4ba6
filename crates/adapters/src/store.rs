// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `ContentStore` port: everything the queue runner needs from the
//! Nix store without parsing its internal formats (§3 "Non-goals":
//! the store itself is treated as opaque).

use async_trait::async_trait;
use qr_core::{BuildOutput, StorePath};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path not found in store: {0}")]
    NotFound(String),
    #[error("copy failed: {0}")]
    CopyFailed(String),
    #[error("gc root failed: {0}")]
    GcRootFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata about a path the store already knows about, as returned by
/// `cmdQueryPathInfos` (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    pub nar_size: u64,
    pub nar_hash: String,
}

/// Everything the runner needs from the destination store: validity
/// queries, closure computation for staging a build's inputs, NAR
/// import/export, GC root planting, and substitution (§3, §6).
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError>;

    /// The full set of store paths reachable from `roots`, used to decide
    /// what must be copied to a remote builder before dispatch.
    async fn compute_closure(&self, roots: &[StorePath]) -> Result<BTreeSet<StorePath>, StoreError>;

    /// Imports a NAR stream (already validated/decoded by [`crate::nar`])
    /// into the store, returning the path it materialized.
    async fn import_path(&self, nar_bytes: &[u8]) -> Result<StorePath, StoreError>;

    /// Exports `path` as a NAR byte stream, the counterpart a builder
    /// worker calls on a finished build's outputs before handing the
    /// bytes to the destination store's `import_path` (§6 "Remote build
    /// wire protocol": `cmdExportPaths`/`cmdImportPaths`).
    async fn export_path(&self, path: &StorePath) -> Result<Vec<u8>, StoreError>;

    /// Plants a GC root under `gc_roots_dir` so a successful build's
    /// outputs survive garbage collection (§6 "gc_roots_dir").
    async fn plant_gc_root(&self, gc_roots_dir: &Path, path: &StorePath) -> Result<PathBuf, StoreError>;

    /// Whether `path` can be obtained from a configured substituter
    /// instead of being built (§3 "A step whose outputs exist in the
    /// destination store ... without contacting any machine", §6
    /// "use-substitutes").
    async fn try_substitute(&self, path: &StorePath) -> Result<bool, StoreError>;

    /// Reads and parses whatever `$out/nix-support/*` artifact files the
    /// build left behind (§6 "Artifact files inside a successful output").
    /// An output with no `nix-support` directory yields an empty
    /// [`BuildOutput`], not an error.
    async fn read_artifacts(&self, path: &StorePath) -> Result<BuildOutput, StoreError>;
}

/// Shells out to the local `nix-store` binary. The store's own formats
/// (ATerm derivations, NAR internals) stay opaque; this adapter only
/// invokes the CLI and parses its line-oriented output.
pub struct LocalStore {
    store_dir: PathBuf,
}

impl LocalStore {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
        }
    }
}

#[async_trait]
impl ContentStore for LocalStore {
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
        let output = tokio::process::Command::new("nix-store")
            .args(["--query", "--references", path.as_str()])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let references = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(StorePath::new)
            .collect();
        let hash_output = tokio::process::Command::new("nix-store")
            .args(["--query", "--hash", path.as_str()])
            .output()
            .await?;
        let nar_hash = String::from_utf8_lossy(&hash_output.stdout).trim().to_string();
        Ok(Some(PathInfo {
            path: path.clone(),
            deriver: None,
            references,
            nar_size: 0,
            nar_hash,
        }))
    }

    async fn compute_closure(&self, roots: &[StorePath]) -> Result<BTreeSet<StorePath>, StoreError> {
        let mut cmd = tokio::process::Command::new("nix-store");
        cmd.args(["--query", "--requisites"]);
        for root in roots {
            cmd.arg(root.as_str());
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(StoreError::CopyFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).lines().map(StorePath::new).collect())
    }

    async fn import_path(&self, nar_bytes: &[u8]) -> Result<StorePath, StoreError> {
        use tokio::io::AsyncWriteExt;
        let mut child = tokio::process::Command::new("nix-store")
            .arg("--import")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .expect("piped stdin")
            .write_all(nar_bytes)
            .await?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(StoreError::CopyFailed(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(StorePath::new(path))
    }

    async fn plant_gc_root(&self, gc_roots_dir: &Path, path: &StorePath) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(gc_roots_dir)?;
        let root_path = gc_roots_dir.join(path.short(12));
        std::os::unix::fs::symlink(self.store_dir.join(path.as_str()), &root_path).or_else(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(root_path)
    }

    async fn try_substitute(&self, path: &StorePath) -> Result<bool, StoreError> {
        let output = tokio::process::Command::new("nix-store")
            .args(["--realise", path.as_str(), "--dry-run"])
            .output()
            .await?;
        Ok(output.status.success())
    }

    async fn export_path(&self, path: &StorePath) -> Result<Vec<u8>, StoreError> {
        let output = tokio::process::Command::new("nix-store")
            .args(["--export", path.as_str()])
            .output()
            .await?;
        if !output.status.success() {
            return Err(StoreError::NotFound(path.as_str().to_string()));
        }
        Ok(output.stdout)
    }

    async fn read_artifacts(&self, path: &StorePath) -> Result<BuildOutput, StoreError> {
        let out_dir = Path::new(path.as_str());
        let mut output = BuildOutput::default();

        if let Ok(contents) = tokio::fs::read_to_string(out_dir.join("nix-support/hydra-build-products")).await {
            output.products = crate::artifacts::parse_build_products(&contents);
        }
        if let Ok(contents) = tokio::fs::read_to_string(out_dir.join("nix-support/hydra-release-name")).await {
            output.release_name = crate::artifacts::parse_release_name(&contents);
        }
        if let Ok(contents) = tokio::fs::read_to_string(out_dir.join("nix-support/hydra-metrics")).await {
            output.metrics = crate::artifacts::parse_metrics(&contents);
        }
        output.failed_with_output = crate::artifacts::has_failed_marker(out_dir);
        Ok(output)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// In-memory stand-in for [`LocalStore`]. `paths` seeds what
    /// `query_path_info`/`compute_closure` already know about;
    /// `substitutable` seeds what `try_substitute` will report as
    /// available without a build.
    #[derive(Clone, Default)]
    pub struct FakeContentStore {
        paths: Arc<Mutex<HashMap<StorePath, PathInfo>>>,
        substitutable: Arc<Mutex<std::collections::HashSet<StorePath>>>,
        imported: Arc<Mutex<Vec<StorePath>>>,
        bytes: Arc<Mutex<HashMap<StorePath, Vec<u8>>>>,
        artifacts: Arc<Mutex<HashMap<StorePath, BuildOutput>>>,
    }

    impl FakeContentStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, info: PathInfo) {
            self.paths.lock().insert(info.path.clone(), info);
        }

        /// Seeds the NAR bytes `export_path` returns for `path`, so tests
        /// can drive a local→destination copy without a real store.
        pub fn seed_bytes(&self, path: StorePath, nar_bytes: Vec<u8>) {
            self.bytes.lock().insert(path, nar_bytes);
        }

        pub fn seed_substitutable(&self, path: StorePath) {
            self.substitutable.lock().insert(path);
        }

        pub fn imported_paths(&self) -> Vec<StorePath> {
            self.imported.lock().clone()
        }

        /// Seeds what `read_artifacts` returns for `path`, so tests can
        /// drive build-product/metric recording without real files.
        pub fn seed_artifacts(&self, path: StorePath, output: BuildOutput) {
            self.artifacts.lock().insert(path, output);
        }
    }

    #[async_trait]
    impl ContentStore for FakeContentStore {
        async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, StoreError> {
            Ok(self.paths.lock().get(path).cloned())
        }

        async fn compute_closure(&self, roots: &[StorePath]) -> Result<BTreeSet<StorePath>, StoreError> {
            let paths = self.paths.lock();
            let mut closure = BTreeSet::new();
            let mut stack: Vec<StorePath> = roots.to_vec();
            while let Some(p) = stack.pop() {
                if !closure.insert(p.clone()) {
                    continue;
                }
                if let Some(info) = paths.get(&p) {
                    stack.extend(info.references.iter().cloned());
                }
            }
            Ok(closure)
        }

        async fn import_path(&self, nar_bytes: &[u8]) -> Result<StorePath, StoreError> {
            let path = StorePath::new(format!("/nix/store/fake-{}", crate::nar::hash_nar(nar_bytes)));
            self.imported.lock().push(path.clone());
            self.paths.lock().insert(
                path.clone(),
                PathInfo {
                    path: path.clone(),
                    deriver: None,
                    references: BTreeSet::new(),
                    nar_size: nar_bytes.len() as u64,
                    nar_hash: crate::nar::hash_nar(nar_bytes),
                },
            );
            self.bytes.lock().insert(path.clone(), nar_bytes.to_vec());
            Ok(path)
        }

        async fn plant_gc_root(&self, gc_roots_dir: &Path, path: &StorePath) -> Result<PathBuf, StoreError> {
            Ok(gc_roots_dir.join(path.short(12)))
        }

        async fn try_substitute(&self, path: &StorePath) -> Result<bool, StoreError> {
            Ok(self.substitutable.lock().contains(path))
        }

        async fn export_path(&self, path: &StorePath) -> Result<Vec<u8>, StoreError> {
            self.bytes
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(path.as_str().to_string()))
        }

        async fn read_artifacts(&self, path: &StorePath) -> Result<BuildOutput, StoreError> {
            Ok(self.artifacts.lock().get(path).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
