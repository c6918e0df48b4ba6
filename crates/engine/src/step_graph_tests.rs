// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use qr_adapters::{FakeContentStore, FakeDerivationStore, PathInfo};
use qr_core::{BasicDerivation, DerivationOutput, JobsetKey, StorePath};
use qr_storage::FakeDatabase;
use std::collections::{BTreeMap, BTreeSet, HashSet};

fn drv(system: &str, input_drvs: BTreeMap<DrvPath, BTreeSet<String>>, out_path: Option<&str>) -> BasicDerivation {
    BasicDerivation {
        builder: "/bin/sh".to_string(),
        args: vec![],
        env: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs,
        outputs: vec![DerivationOutput {
            name: "out".to_string(),
            path: out_path.map(StorePath::new),
        }],
        system: system.to_string(),
        required_features: BTreeSet::new(),
        is_deterministic: false,
        prefer_local_build: false,
    }
}

struct Harness {
    database: FakeDatabase,
    derivations: FakeDerivationStore,
    destination: FakeContentStore,
    local: FakeContentStore,
    stepnr: AtomicI32,
    gc_roots_dir: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        Self {
            database: FakeDatabase::new(),
            derivations: FakeDerivationStore::new(),
            destination: FakeContentStore::new(),
            local: FakeContentStore::new(),
            stepnr: AtomicI32::new(1),
            gc_roots_dir: std::path::PathBuf::from("/tmp/gcroots"),
        }
    }

    fn ctx(&self) -> CreateStepCtx<'_> {
        CreateStepCtx {
            database: &self.database,
            derivation_store: &self.derivations,
            local_store: &self.local,
            destination_store: &self.destination,
            stepnr: &self.stepnr,
            build_id: BuildId::new(1),
            gc_roots_dir: &self.gc_roots_dir,
        }
    }
}

#[tokio::test]
async fn single_derivation_with_no_deps_is_runnable() {
    let harness = Harness::new();
    let path = DrvPath::new("/nix/store/x.drv");
    harness
        .derivations
        .seed(path.clone(), drv("x86_64-linux", BTreeMap::new(), Some("/nix/store/x-out")));

    let graph = StepGraph::new();
    let outcome = graph.create_step(&harness.ctx(), &path, None).await.unwrap();
    let CreateStepOutcome::Step(step) = outcome else {
        panic!("expected a live step");
    };
    assert!(step.state.lock().is_runnable());
    assert_eq!(graph.runnable_steps().len(), 1);
}

#[tokio::test]
async fn missing_dep_substitutable_resolves_without_a_step() {
    let harness = Harness::new();
    let dep_path = DrvPath::new("/nix/store/dep.drv");
    let dep_out = "/nix/store/dep-out";
    harness
        .derivations
        .seed(dep_path.clone(), drv("x86_64-linux", BTreeMap::new(), Some(dep_out)));
    harness.local.seed(PathInfo {
        path: StorePath::new(dep_out),
        deriver: None,
        references: BTreeSet::new(),
        nar_size: 0,
        nar_hash: String::new(),
    });

    let mut input_drvs = BTreeMap::new();
    input_drvs.insert(dep_path.clone(), ["out".to_string()].into_iter().collect());
    let top_path = DrvPath::new("/nix/store/top.drv");
    harness
        .derivations
        .seed(top_path.clone(), drv("x86_64-linux", input_drvs, Some("/nix/store/top-out")));

    let graph = StepGraph::new();
    let outcome = graph.create_step(&harness.ctx(), &top_path, None).await.unwrap();
    let CreateStepOutcome::Step(step) = outcome else {
        panic!("expected a live step for the top derivation");
    };
    // The dep resolved via substitution, so the top step has no deps left.
    assert!(step.state.lock().deps.is_empty());
    assert!(graph.get_step(&dep_path).is_none());
}

#[tokio::test]
async fn cached_failure_short_circuits_to_previous_failure() {
    let harness = Harness::new();
    let out_path = "/nix/store/known-bad";
    harness.database.mark_path_failed(out_path).await.unwrap();

    let path = DrvPath::new("/nix/store/bad.drv");
    harness
        .derivations
        .seed(path.clone(), drv("x86_64-linux", BTreeMap::new(), Some(out_path)));

    let graph = StepGraph::new();
    let outcome = graph.create_step(&harness.ctx(), &path, None).await.unwrap();
    assert!(matches!(outcome, CreateStepOutcome::PreviousFailure));
}

#[tokio::test]
async fn priority_propagates_down_the_dep_chain() {
    let harness = Harness::new();
    let dep_path = DrvPath::new("/nix/store/dep.drv");
    harness
        .derivations
        .seed(dep_path.clone(), drv("x86_64-linux", BTreeMap::new(), None));

    let mut input_drvs = BTreeMap::new();
    input_drvs.insert(dep_path.clone(), ["out".to_string()].into_iter().collect());
    let top_path = DrvPath::new("/nix/store/top.drv");
    harness
        .derivations
        .seed(top_path.clone(), drv("x86_64-linux", input_drvs, None));

    let graph = StepGraph::new();
    let CreateStepOutcome::Step(top) = graph.create_step(&harness.ctx(), &top_path, None).await.unwrap() else {
        panic!("expected top step");
    };
    graph.propagate_priority(&top, 100, 5, BuildId::new(1));

    let dep = graph.get_step(&dep_path).unwrap();
    assert_eq!(dep.state.lock().highest_global_priority, 100);
    assert_eq!(top.state.lock().highest_global_priority, 100);
}

#[tokio::test]
async fn completing_a_step_wakes_its_runnable_rdep() {
    let harness = Harness::new();
    let dep_path = DrvPath::new("/nix/store/dep.drv");
    harness
        .derivations
        .seed(dep_path.clone(), drv("x86_64-linux", BTreeMap::new(), None));

    let mut input_drvs = BTreeMap::new();
    input_drvs.insert(dep_path.clone(), ["out".to_string()].into_iter().collect());
    let top_path = DrvPath::new("/nix/store/top.drv");
    harness
        .derivations
        .seed(top_path.clone(), drv("x86_64-linux", input_drvs, None));

    let graph = StepGraph::new();
    let CreateStepOutcome::Step(top) = graph.create_step(&harness.ctx(), &top_path, None).await.unwrap() else {
        panic!("expected top step");
    };
    let dep = graph.get_step(&dep_path).unwrap();

    // Top depends on dep, so only dep is runnable at first.
    let runnable_drv_paths: Vec<DrvPath> = graph.runnable_steps().iter().map(|s| s.drv_path.clone()).collect();
    assert_eq!(runnable_drv_paths, vec![dep_path.clone()]);

    let woken = graph.on_step_done(&dep);
    assert_eq!(woken.len(), 1);
    assert_eq!(woken[0].drv_path, top_path);
    assert!(top.state.lock().is_runnable());
}

#[tokio::test]
async fn failing_a_step_cascades_done_through_its_whole_rdep_subtree() {
    let harness = Harness::new();
    let dep_path = DrvPath::new("/nix/store/dep.drv");
    harness
        .derivations
        .seed(dep_path.clone(), drv("x86_64-linux", BTreeMap::new(), None));

    let mut input_drvs = BTreeMap::new();
    input_drvs.insert(dep_path.clone(), ["out".to_string()].into_iter().collect());
    let top_path = DrvPath::new("/nix/store/top.drv");
    harness
        .derivations
        .seed(top_path.clone(), drv("x86_64-linux", input_drvs, None));

    let graph = StepGraph::new();
    let CreateStepOutcome::Step(top) = graph.create_step(&harness.ctx(), &top_path, None).await.unwrap() else {
        panic!("expected top step");
    };
    let dep = graph.get_step(&dep_path).unwrap();

    let failed = graph.on_step_failed(&dep);
    let failed_paths: HashSet<DrvPath> = failed.iter().map(|s| s.drv_path.clone()).collect();
    assert_eq!(failed_paths, HashSet::from([dep_path, top_path]));
    assert!(matches!(top.state.lock().status, StepStatus::Done));
    assert!(graph.runnable_steps().is_empty());
}

#[tokio::test]
async fn attach_build_tracks_jobset_accounting() {
    let harness = Harness::new();
    let path = DrvPath::new("/nix/store/x.drv");
    harness
        .derivations
        .seed(path.clone(), drv("x86_64-linux", BTreeMap::new(), None));

    let graph = StepGraph::new();
    let CreateStepOutcome::Step(step) = graph.create_step(&harness.ctx(), &path, None).await.unwrap() else {
        panic!("expected step");
    };
    let build = Arc::new(Build::new(
        BuildId::new(1),
        path.clone(),
        "proj",
        JobsetKey::new("proj", "trunk"),
        "job",
        0,
        0,
        0,
        0,
        0,
        &step,
    ));
    StepGraph::attach_build(&step, &build);
    assert!(step.state.lock().jobsets.contains(&JobsetKey::new("proj", "trunk")));
    assert_eq!(step.state.lock().live_builds().count(), 1);
}
