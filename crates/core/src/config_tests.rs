// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn defaults_match_spec_values() {
    let cfg = RunnerConfig::default();
    assert_eq!(cfg.max_db_connections, 128);
    assert_eq!(cfg.max_output_size, 2 * 1024 * 1024 * 1024);
    assert_eq!(cfg.max_log_size, 64 * 1024 * 1024);
    assert_eq!(cfg.max_tries, 5);
    assert_eq!(cfg.retry_interval_secs, 60);
    assert_eq!(cfg.retry_backoff, 3.0);
    assert_eq!(cfg.max_parallel_copy_closure, 4);
}

#[test]
fn partial_toml_fills_remaining_fields_from_defaults() {
    let cfg = RunnerConfig::from_toml_str(
        r#"
        database_url = "postgres://db/qr"
        machines_file = "/etc/nix/machines"
        store_uri = ""
        use_substitutes = true
        upload_logs_to_binary_cache = true
        jobset_repeats = []
        "#,
    )
    .unwrap();
    assert_eq!(cfg.database_url, "postgres://db/qr");
    assert_eq!(cfg.max_db_connections, 128);
    assert!(cfg.upload_logs_to_binary_cache);
}

#[test]
fn jobset_repeat_parses_project_jobset_n() {
    let repeat: JobsetRepeat = "nixpkgs:trunk:3".parse().unwrap();
    assert_eq!(repeat.project, "nixpkgs");
    assert_eq!(repeat.jobset, "trunk");
    assert_eq!(repeat.repeats, 3);
}

#[test]
fn jobset_repeat_rejects_malformed_entry() {
    assert!("nixpkgs:trunk".parse::<JobsetRepeat>().is_err());
    assert!("nixpkgs:trunk:not-a-number".parse::<JobsetRepeat>().is_err());
}

#[test]
fn validate_rejects_zero_db_connections() {
    let mut cfg = RunnerConfig::default();
    cfg.max_db_connections = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_rejects_sub_unity_backoff() {
    let mut cfg = RunnerConfig::default();
    cfg.retry_backoff = 0.5;
    assert!(cfg.validate().is_err());
}

#[test]
fn validate_accepts_defaults() {
    assert!(RunnerConfig::default().validate().is_ok());
}
