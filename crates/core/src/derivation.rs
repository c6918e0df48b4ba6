// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parsed derivation bodies.
//!
//! The on-disk derivation format (the ATerm-like `.drv` serialization) is
//! owned by the store, which spec.md treats as an opaque collaborator with
//! well-defined operations. This module only defines the shape a parsed
//! derivation takes once the store hands it to us — see the `DerivationStore`
//! port in `qr-adapters` for where an implementation plugs in.

use crate::ids::{DrvPath, StorePath};
use std::collections::{BTreeMap, BTreeSet};

/// One output declared by a derivation: its name (`"out"`, `"dev"`, ...) and,
/// once known, the content-addressed path it realizes to.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DerivationOutput {
    pub name: String,
    pub path: Option<StorePath>,
}

/// A fully parsed derivation (§3 "Step", §4.1 step 2).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BasicDerivation {
    /// Path to the builder executable inside the build sandbox.
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Store paths referenced directly by the derivation (source files).
    pub input_srcs: BTreeSet<StorePath>,
    /// Other derivations this one depends on, each with the subset of that
    /// derivation's output names actually required.
    pub input_drvs: BTreeMap<DrvPath, BTreeSet<String>>,
    pub outputs: Vec<DerivationOutput>,
    /// The Nix `system` string, e.g. `x86_64-linux`.
    pub system: String,
    /// `requiredSystemFeatures` declared by the derivation.
    pub required_features: BTreeSet<String>,
    /// Whether the derivation requests a content-addressed / repeatable
    /// build (`__contentAddressed` or `outputHashMode == "recursive"` with
    /// a fixed hash checked for determinism).
    pub is_deterministic: bool,
    /// `preferLocalBuild` derivation attribute.
    pub prefer_local_build: bool,
}

impl BasicDerivation {
    /// The concatenation of `system` and required features used as the
    /// dispatch platform string (§3 "Step").
    pub fn platform_string(&self) -> String {
        if self.required_features.is_empty() {
            self.system.clone()
        } else {
            let feats: Vec<&str> = self.required_features.iter().map(String::as_str).collect();
            format!("{}-{}", self.system, feats.join(","))
        }
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.name.as_str())
    }

    pub fn missing_outputs(&self) -> impl Iterator<Item = &DerivationOutput> {
        self.outputs.iter().filter(|o| o.path.is_none())
    }
}

/// A derivation together with the path it was read from — the unit the
/// Queue Monitor operates on when building the Step Graph.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Derivation {
    pub path: DrvPath,
    pub body: BasicDerivation,
}

#[cfg(test)]
#[path = "derivation_tests.rs"]
mod tests;
