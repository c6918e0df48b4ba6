// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::fake::FakeDerivationStore;
use super::*;
use qr_core::DerivationOutput;

fn sample() -> BasicDerivation {
    BasicDerivation {
        builder: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "true".to_string()],
        env: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs: BTreeMap::new(),
        outputs: vec![DerivationOutput {
            name: "out".to_string(),
            path: None,
        }],
        system: "x86_64-linux".to_string(),
        required_features: BTreeSet::new(),
        is_deterministic: false,
        prefer_local_build: false,
    }
}

#[tokio::test]
async fn seeded_derivation_round_trips() {
    let store = FakeDerivationStore::new();
    let path = DrvPath::new("/nix/store/abc-foo.drv");
    store.seed(path.clone(), sample());
    let read = store.read_derivation(&path).await.unwrap();
    assert_eq!(read.system, "x86_64-linux");
}

#[tokio::test]
async fn written_derivation_is_readable_back_at_its_returned_path() {
    let store = FakeDerivationStore::new();
    let path = store.write_derivation(&sample()).await.unwrap();
    let read = store.read_derivation(&path).await.unwrap();
    assert_eq!(read.system, "x86_64-linux");
}

#[tokio::test]
async fn unknown_path_errors() {
    let store = FakeDerivationStore::new();
    let err = store
        .read_derivation(&DrvPath::new("/nix/store/ghost.drv"))
        .await
        .unwrap_err();
    assert!(matches!(err, DerivationStoreError::NotFound(_)));
}

#[test]
fn parse_entry_reads_required_features_and_prefer_local() {
    let json = serde_json::json!({
        "builder": "/bin/sh",
        "system": "x86_64-linux",
        "args": ["-c", "true"],
        "env": {
            "requiredSystemFeatures": "big-parallel kvm",
            "preferLocalBuild": "1",
        },
        "inputSrcs": ["/nix/store/src"],
        "inputDrvs": {"/nix/store/dep.drv": ["out"]},
        "outputs": {"out": {"path": "/nix/store/result"}},
    });
    let drv = parse_entry(&json).unwrap();
    assert!(drv.required_features.contains("big-parallel"));
    assert!(drv.required_features.contains("kvm"));
    assert!(drv.prefer_local_build);
    assert_eq!(drv.outputs[0].path.as_ref().unwrap().as_str(), "/nix/store/result");
    assert!(drv.input_drvs.contains_key(&DrvPath::new("/nix/store/dep.drv")));
}
