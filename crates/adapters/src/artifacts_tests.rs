// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn parses_unquoted_products_line() {
    let products = parse_build_products("doc manual /nix/store/abc-doc/index.html index.html\n");
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].product_type, "doc");
    assert_eq!(products[0].subtype, "manual");
    assert_eq!(products[0].path, "/nix/store/abc-doc/index.html");
    assert_eq!(products[0].default_path, "index.html");
}

#[test]
fn parses_quoted_path_with_embedded_whitespace() {
    let products = parse_build_products(r#"doc manual "/nix/store/abc-doc/a file.html""#);
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].path, "/nix/store/abc-doc/a file.html");
}

#[test]
fn non_store_paths_are_skipped() {
    let products = parse_build_products("doc manual ../etc/passwd");
    assert!(products.is_empty());
}

#[test]
fn release_name_must_match_allowed_charset() {
    assert_eq!(parse_release_name(" hello-1.0 \n"), Some("hello-1.0".to_string()));
    assert_eq!(parse_release_name("bad name!\n"), None);
    assert_eq!(parse_release_name(""), None);
}

#[test]
fn metrics_parse_name_value_and_optional_unit() {
    let metrics = parse_metrics("closure-size 12345 bytes\ncoverage 87.5\n");
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[0].name, "closure-size");
    assert_eq!(metrics[0].value, 12345.0);
    assert_eq!(metrics[0].unit.as_deref(), Some("bytes"));
    assert_eq!(metrics[1].unit, None);
}

#[test]
fn metrics_line_with_non_numeric_value_is_skipped() {
    let metrics = parse_metrics("closure-size not-a-number\n");
    assert!(metrics.is_empty());
}

#[test]
fn failed_marker_detected_by_presence() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!has_failed_marker(dir.path()));
    std::fs::create_dir_all(dir.path().join("nix-support")).unwrap();
    std::fs::write(dir.path().join("nix-support").join("failed"), "").unwrap();
    assert!(has_failed_marker(dir.path()));
}
