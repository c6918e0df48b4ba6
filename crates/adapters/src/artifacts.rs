// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parsers for the `$out/nix-support/*` artifact files a successful build
//! may leave behind (§6 "Artifact files inside a successful output").

use qr_core::{BuildMetric, BuildProduct};

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '@' | ':' | '_' | ' ' | '-'))
        .collect()
}

fn is_store_path(path: &str) -> bool {
    path.starts_with('/') && !path.contains("..")
}

/// Splits a products line into tokens, honoring a double-quoted path field
/// that may contain whitespace (§6: "PATH may be quoted").
fn tokenize_products_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses `$out/nix-support/hydra-build-products`: lines of `TYPE SUBTYPE
/// PATH [DEFAULT]`. Lines whose path isn't absolute-and-in-store are
/// skipped rather than erroring, matching Hydra's permissive parsing of
/// build-declared metadata it doesn't otherwise trust.
pub fn parse_build_products(contents: &str) -> Vec<BuildProduct> {
    let mut products = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let tokens = tokenize_products_line(line);
        if tokens.len() < 3 {
            continue;
        }
        let path = &tokens[2];
        if !is_store_path(path) {
            continue;
        }
        let default_path = tokens.get(3).cloned().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or(path);
        products.push(BuildProduct {
            product_type: sanitize_name(&tokens[0]),
            subtype: sanitize_name(&tokens[1]),
            file_size: None,
            sha256_hash: None,
            path: path.clone(),
            name: sanitize_name(name),
            default_path: sanitize_name(&default_path),
        });
    }
    products
}

fn is_release_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '@' | ':' | '_' | '-'))
}

/// Parses `$out/nix-support/hydra-release-name`: trimmed contents, must
/// match `[a-zA-Z0-9.@:_-]+` or the file is ignored.
pub fn parse_release_name(contents: &str) -> Option<String> {
    let trimmed = contents.trim();
    is_release_name(trimmed).then(|| trimmed.to_string())
}

fn is_metric_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_metric_unit(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '-'))
}

/// Parses `$out/nix-support/hydra-metrics`: lines of `NAME VALUE [UNIT]`.
pub fn parse_metrics(contents: &str) -> Vec<BuildMetric> {
    let mut metrics = Vec::new();
    for line in contents.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        if !is_metric_name(tokens[0]) {
            continue;
        }
        let Ok(value) = tokens[1].parse::<f64>() else {
            continue;
        };
        let unit = tokens.get(2).filter(|u| is_metric_unit(u)).map(|u| u.to_string());
        metrics.push(BuildMetric {
            name: tokens[0].to_string(),
            unit,
            value,
        });
    }
    metrics
}

/// `$out/nix-support/failed` existing (any contents) marks the build
/// `failed=true` while leaving its status `bsSuccess`/`bsFailedWithOutput`
/// (§6, §7).
pub fn has_failed_marker(out_path: &std::path::Path) -> bool {
    out_path.join("nix-support").join("failed").exists()
}

#[cfg(test)]
#[path = "artifacts_tests.rs"]
mod tests;
