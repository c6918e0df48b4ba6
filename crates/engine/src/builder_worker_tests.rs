// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use qr_adapters::{FakeBuilderTransport, FakeContentStore, FakeDerivationStore, PathInfo};
use qr_core::{BasicDerivation, DerivationOutput, DrvPath, FakeClock, MachineName};
use std::collections::{BTreeMap, BTreeSet};

fn tokens() -> tokio::sync::Semaphore {
    tokio::sync::Semaphore::new(u32::MAX as usize)
}

fn derivation(outputs: Vec<DerivationOutput>) -> BasicDerivation {
    BasicDerivation {
        builder: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "true".to_string()],
        env: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs: BTreeMap::new(),
        outputs,
        system: "x86_64-linux".to_string(),
        required_features: BTreeSet::new(),
        is_deterministic: false,
        prefer_local_build: false,
    }
}

fn machine() -> Machine {
    Machine::new(MachineName::new("m1"), ["x86_64-linux".to_string()].into_iter().collect(), 1, 1.0)
}

#[tokio::test]
async fn run_attempt_surfaces_a_transport_failure() {
    let transport = FakeBuilderTransport::new();
    transport.fail_for("m1");
    let local = FakeContentStore::new();
    let destination = FakeContentStore::new();
    let derivations = FakeDerivationStore::new();
    let m = machine();
    let step = Arc::new(Step::new(
        DrvPath::new("/nix/store/x.drv"),
        derivation(vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(StorePath::new("/nix/store/out")),
        }]),
    ));
    let clock = FakeClock::new();
    let config = BuilderWorkerConfig {
        max_log_size: 1024,
        gc_roots_dir: std::path::PathBuf::from("/tmp/gcroots"),
        max_output_size: u64::MAX,
        memory_tokens_total: u64::MAX,
    };
    let tokens = tokens();

    let err = run_attempt(&transport, &local, &destination, &derivations, &m, &step, &config, &clock, &tokens, 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BuilderWorkerError::Transport(_)));
}

#[tokio::test]
async fn run_attempt_surfaces_a_protocol_error_when_peer_is_silent() {
    let transport = FakeBuilderTransport::new();
    let local = FakeContentStore::new();
    let destination = FakeContentStore::new();
    let derivations = FakeDerivationStore::new();
    let m = machine();
    let step = Arc::new(Step::new(
        DrvPath::new("/nix/store/x.drv"),
        derivation(vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(StorePath::new("/nix/store/out")),
        }]),
    ));
    let clock = FakeClock::new();
    let config = BuilderWorkerConfig {
        max_log_size: 1024,
        gc_roots_dir: std::path::PathBuf::from("/tmp/gcroots"),
        max_output_size: u64::MAX,
        memory_tokens_total: u64::MAX,
    };
    let tokens = tokens();

    let err = run_attempt(&transport, &local, &destination, &derivations, &m, &step, &config, &clock, &tokens, 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, BuilderWorkerError::Protocol(_)));
}

fn import_config() -> BuilderWorkerConfig {
    BuilderWorkerConfig {
        max_log_size: 1024,
        gc_roots_dir: std::path::PathBuf::from("/tmp/gcroots"),
        max_output_size: u64::MAX,
        memory_tokens_total: u64::MAX,
    }
}

#[tokio::test]
async fn import_outputs_copies_paths_missing_from_the_destination() {
    let local = FakeContentStore::new();
    let destination = FakeContentStore::new();
    let out_path = StorePath::new("/nix/store/out");
    local.seed_bytes(out_path.clone(), b"output bytes".to_vec());

    let step = Arc::new(Step::new(
        DrvPath::new("/nix/store/x.drv"),
        derivation(vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(out_path.clone()),
        }]),
    ));

    let outcome = import_outputs(&local, &destination, &step, &import_config(), &tokens()).await.unwrap();
    assert!(matches!(outcome, ImportOutcome::Imported(_)));
    assert_eq!(destination.imported_paths().len(), 1);
}

#[tokio::test]
async fn import_outputs_skips_paths_already_at_the_destination() {
    let local = FakeContentStore::new();
    let destination = FakeContentStore::new();
    let out_path = StorePath::new("/nix/store/out");
    destination.seed(PathInfo {
        path: out_path.clone(),
        deriver: None,
        references: BTreeSet::new(),
        nar_size: 0,
        nar_hash: String::new(),
    });

    let step = Arc::new(Step::new(
        DrvPath::new("/nix/store/x.drv"),
        derivation(vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(out_path),
        }]),
    ));

    import_outputs(&local, &destination, &step, &import_config(), &tokens()).await.unwrap();

    assert!(destination.imported_paths().is_empty());
}

#[tokio::test]
async fn import_outputs_reports_nar_size_limit_exceeded_without_copying() {
    let local = FakeContentStore::new();
    let destination = FakeContentStore::new();
    let out_path = StorePath::new("/nix/store/out");
    local.seed(PathInfo {
        path: out_path.clone(),
        deriver: None,
        references: BTreeSet::new(),
        nar_size: 1024,
        nar_hash: String::new(),
    });
    local.seed_bytes(out_path.clone(), b"output bytes".to_vec());

    let step = Arc::new(Step::new(
        DrvPath::new("/nix/store/x.drv"),
        derivation(vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(out_path),
        }]),
    ));

    let mut config = import_config();
    config.max_output_size = 100;

    let outcome = import_outputs(&local, &destination, &step, &config, &tokens()).await.unwrap();
    assert!(matches!(outcome, ImportOutcome::NarSizeLimitExceeded));
    assert!(destination.imported_paths().is_empty());
}

#[tokio::test]
async fn import_outputs_gathers_products_and_metrics_from_every_output() {
    let local = FakeContentStore::new();
    let destination = FakeContentStore::new();
    let out_path = StorePath::new("/nix/store/out");
    local.seed_bytes(out_path.clone(), b"output bytes".to_vec());
    local.seed_artifacts(
        out_path.clone(),
        qr_core::BuildOutput {
            release_name: Some("myproject-1.0".to_string()),
            products: vec![qr_core::BuildProduct {
                product_type: "file".to_string(),
                subtype: "".to_string(),
                file_size: None,
                sha256_hash: None,
                path: "/nix/store/out/result.tar.gz".to_string(),
                name: "result.tar.gz".to_string(),
                default_path: "".to_string(),
            }],
            metrics: vec![qr_core::BuildMetric { name: "coverage".to_string(), unit: Some("%".to_string()), value: 87.5 }],
            ..Default::default()
        },
    );

    let step = Arc::new(Step::new(
        DrvPath::new("/nix/store/x.drv"),
        derivation(vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(out_path),
        }]),
    ));

    let outcome = import_outputs(&local, &destination, &step, &import_config(), &tokens()).await.unwrap();
    let ImportOutcome::Imported(output) = outcome else { panic!("expected Imported") };
    assert_eq!(output.release_name.as_deref(), Some("myproject-1.0"));
    assert_eq!(output.products.len(), 1);
    assert_eq!(output.metrics.len(), 1);
    assert!(!output.failed_with_output);
}
