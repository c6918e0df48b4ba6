// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use qr_adapters::{FakeContentStore, FakeDerivationStore};
use qr_core::{BasicDerivation, DerivationOutput, FakeClock, StorePath};
use qr_storage::{records::NewBuild, FakeDatabase, FakeNotifier};
use std::collections::{BTreeMap, BTreeSet};

fn drv(input_drvs: BTreeMap<DrvPath, BTreeSet<String>>, out_path: &str) -> BasicDerivation {
    BasicDerivation {
        builder: "/bin/sh".to_string(),
        args: vec![],
        env: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs,
        outputs: vec![DerivationOutput {
            name: "out".to_string(),
            path: Some(StorePath::new(out_path)),
        }],
        system: "x86_64-linux".to_string(),
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
    notifier: FakeNotifier,
    stepnr: AtomicI32,
    clock: FakeClock,
    gc_roots_dir: std::path::PathBuf,
}

impl Harness {
    fn new() -> Self {
        Self {
            database: FakeDatabase::new(),
            derivations: FakeDerivationStore::new(),
            destination: FakeContentStore::new(),
            local: FakeContentStore::new(),
            notifier: FakeNotifier::new(),
            stepnr: AtomicI32::new(1),
            clock: FakeClock::new(),
            gc_roots_dir: std::path::PathBuf::from("/tmp/gcroots"),
        }
    }

    fn deps(&self) -> QueueMonitorDeps<'_, FakeClock> {
        QueueMonitorDeps {
            database: &self.database,
            derivation_store: &self.derivations,
            local_store: &self.local,
            destination_store: &self.destination,
            notifier: &self.notifier,
            stepnr: &self.stepnr,
            clock: &self.clock,
            gc_roots_dir: &self.gc_roots_dir,
        }
    }

    async fn queue(&self, drv_path: &str, global_priority: i64, priority: i64) -> i64 {
        let jobset = self.database.get_or_create_jobset("proj", "trunk").await.unwrap();
        self.database
            .queue_build(NewBuild {
                jobset_id: jobset.id,
                job: "job".to_string(),
                drv_path: drv_path.to_string(),
                maxsilent: 0,
                timeout: 0,
                timestamp: 0,
                global_priority,
                priority,
            })
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn new_build_queued_produces_a_runnable_step() {
    let harness = Harness::new();
    let path = DrvPath::new("/nix/store/x.drv");
    harness.derivations.seed(path.clone(), drv(BTreeMap::new(), "/nix/store/x-out"));
    let build_row_id = harness.queue("/nix/store/x.drv", 0, 0).await;

    let graph = StepGraph::new();
    poll_queue_once(&graph, &harness.deps()).await.unwrap();

    assert!(graph.build_ids().contains(&BuildId::new(build_row_id)));
    let step = graph.get_step(&path).unwrap();
    assert!(step.state.lock().is_runnable());
    assert_eq!(graph.runnable_steps().len(), 1);
}

#[tokio::test]
async fn build_failing_on_its_own_output_finishes_as_failed() {
    let harness = Harness::new();
    let out_path = "/nix/store/known-bad";
    harness.database.mark_path_failed(out_path).await.unwrap();
    harness
        .derivations
        .seed(DrvPath::new("/nix/store/bad.drv"), drv(BTreeMap::new(), out_path));
    let build_row_id = harness.queue("/nix/store/bad.drv", 0, 0).await;

    let graph = StepGraph::new();
    poll_queue_once(&graph, &harness.deps()).await.unwrap();

    let row = harness.database.get_build(build_row_id).await.unwrap();
    assert!(row.finished);
    assert_eq!(row.build_status, Some(BuildStatus::Failed.as_i32()));
}

#[tokio::test]
async fn build_failing_on_a_dependencys_output_finishes_as_dep_failed() {
    let harness = Harness::new();
    let dep_out = "/nix/store/known-bad";
    harness.database.mark_path_failed(dep_out).await.unwrap();
    harness
        .derivations
        .seed(DrvPath::new("/nix/store/dep.drv"), drv(BTreeMap::new(), dep_out));

    let mut input_drvs = BTreeMap::new();
    input_drvs.insert(DrvPath::new("/nix/store/dep.drv"), ["out".to_string()].into_iter().collect());
    harness
        .derivations
        .seed(DrvPath::new("/nix/store/top.drv"), drv(input_drvs, "/nix/store/top-out"));
    let build_row_id = harness.queue("/nix/store/top.drv", 0, 0).await;

    let graph = StepGraph::new();
    poll_queue_once(&graph, &harness.deps()).await.unwrap();

    let row = harness.database.get_build(build_row_id).await.unwrap();
    assert!(row.finished);
    assert_eq!(row.build_status, Some(BuildStatus::DepFailed.as_i32()));
}

#[tokio::test]
async fn cached_success_build_finishes_without_entering_the_graph() {
    let harness = Harness::new();
    let out_path = StorePath::new("/nix/store/already-there");
    harness.destination.seed(qr_adapters::PathInfo {
        path: out_path.clone(),
        deriver: None,
        references: BTreeSet::new(),
        nar_size: 0,
        nar_hash: String::new(),
    });
    harness
        .derivations
        .seed(DrvPath::new("/nix/store/x.drv"), drv(BTreeMap::new(), "/nix/store/already-there"));
    let build_row_id = harness.queue("/nix/store/x.drv", 0, 0).await;

    let graph = StepGraph::new();
    poll_queue_once(&graph, &harness.deps()).await.unwrap();

    assert!(!graph.build_ids().contains(&BuildId::new(build_row_id)));
    let row = harness.database.get_build(build_row_id).await.unwrap();
    assert!(row.finished);
    assert_eq!(row.build_status, Some(BuildStatus::Success.as_i32()));
}

#[tokio::test]
async fn process_queue_change_drops_builds_no_longer_queued() {
    let harness = Harness::new();
    harness
        .derivations
        .seed(DrvPath::new("/nix/store/x.drv"), drv(BTreeMap::new(), "/nix/store/x-out"));
    let build_row_id = harness.queue("/nix/store/x.drv", 0, 0).await;

    let graph = StepGraph::new();
    poll_queue_once(&graph, &harness.deps()).await.unwrap();
    assert!(graph.build_ids().contains(&BuildId::new(build_row_id)));

    // The build is deleted out from under the monitor (client cancellation,
    // e.g.) without a matching row in the next scan.
    let removed = process_queue_change(&graph, &[]);
    assert_eq!(removed, vec![BuildId::new(build_row_id)]);
    assert!(graph.build_ids().is_empty());
}

#[tokio::test]
async fn priority_bump_is_repropagated_on_the_next_poll() {
    let harness = Harness::new();
    harness
        .derivations
        .seed(DrvPath::new("/nix/store/x.drv"), drv(BTreeMap::new(), "/nix/store/x-out"));
    let build_row_id = harness.queue("/nix/store/x.drv", 0, 0).await;

    let graph = StepGraph::new();
    poll_queue_once(&graph, &harness.deps()).await.unwrap();

    harness.database.bump_build_priority(build_row_id, 50).await.unwrap();
    let rows = harness.database.list_queued_builds().await.unwrap();
    process_queue_change(&graph, &rows);

    let step = graph.get_step(&DrvPath::new("/nix/store/x.drv")).unwrap();
    assert_eq!(step.state.lock().highest_local_priority, 50);
}
