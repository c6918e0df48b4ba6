// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::step_graph::CreateStepCtx;
use qr_adapters::{FakeBuilderTransport, FakeContentStore, FakeDerivationStore};
use qr_core::{BasicDerivation, DerivationOutput, DrvPath, FakeClock, MachineName, StorePath};
use qr_core::Build;
use qr_storage::{records::NewBuild, FakeDatabase};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicI32;
use std::time::Duration;

fn drv(out_path: &str) -> BasicDerivation {
    BasicDerivation {
        builder: "/bin/sh".to_string(),
        args: vec![],
        env: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs: BTreeMap::new(),
        outputs: vec![DerivationOutput { name: "out".to_string(), path: Some(StorePath::new(out_path)) }],
        system: "x86_64-linux".to_string(),
        required_features: BTreeSet::new(),
        is_deterministic: false,
        prefer_local_build: false,
    }
}

async fn seed_build(
    graph: &StepGraph,
    database: &FakeDatabase,
    derivations: &FakeDerivationStore,
    destination: &FakeContentStore,
    local: &FakeContentStore,
    stepnr: &AtomicI32,
    gc_roots_dir: &std::path::Path,
    drv_path: &str,
    out_path: &str,
) -> i64 {
    derivations.seed(DrvPath::new(drv_path), drv(out_path));
    let jobset = database.get_or_create_jobset("proj", "trunk").await.unwrap();
    let build_row_id = database
        .queue_build(NewBuild {
            jobset_id: jobset.id,
            job: "job".to_string(),
            drv_path: drv_path.to_string(),
            maxsilent: 0,
            timeout: 0,
            timestamp: 0,
            global_priority: 0,
            priority: 0,
        })
        .await
        .unwrap();

    let ctx = CreateStepCtx {
        database,
        derivation_store: derivations,
        local_store: local,
        destination_store: destination,
        stepnr,
        build_id: qr_core::BuildId::new(build_row_id),
        gc_roots_dir,
    };
    let crate::step_graph::CreateStepOutcome::Step(step) =
        graph.create_step(&ctx, &DrvPath::new(drv_path), None).await.unwrap()
    else {
        panic!("expected a live step");
    };
    let build = Arc::new(Build::new(
        qr_core::BuildId::new(build_row_id),
        DrvPath::new(drv_path),
        "proj",
        qr_core::JobsetKey::new("proj", "trunk"),
        "job",
        0,
        0,
        0,
        0,
        0,
        &step,
    ));
    StepGraph::attach_build(&step, &build);
    graph.insert_build(build);
    build_row_id
}

fn failing_deps(
    database: Arc<FakeDatabase>,
    destination: Arc<FakeContentStore>,
    local: Arc<FakeContentStore>,
    machines: Vec<Arc<Machine>>,
    retry: RetryConfig,
) -> Arc<DispatchLoopDeps<FakeClock>> {
    let transport = Arc::new(FakeBuilderTransport::new());
    for machine in &machines {
        transport.fail_for(machine.name.as_str());
    }
    Arc::new(DispatchLoopDeps {
        database,
        local_store: local,
        destination_store: destination,
        derivation_store: Arc::new(FakeDerivationStore::new()),
        transport,
        machines,
        clock: FakeClock::new(),
        worker_config: BuilderWorkerConfig {
            max_log_size: 1024,
            gc_roots_dir: std::path::PathBuf::from("/tmp/gcroots"),
            max_output_size: u64::MAX,
            memory_tokens_total: u64::MAX,
        },
        retry,
        memory_tokens: Arc::new(tokio::sync::Semaphore::new(u32::MAX as usize)),
        max_unsupported_time: Duration::from_secs(86400),
    })
}

#[tokio::test]
async fn a_failing_attempt_is_retried_until_max_tries_then_aborts_the_build() {
    let database = Arc::new(FakeDatabase::new());
    let derivations = Arc::new(FakeDerivationStore::new());
    let destination = Arc::new(FakeContentStore::new());
    let local = Arc::new(FakeContentStore::new());
    let stepnr = AtomicI32::new(1);
    let graph = Arc::new(StepGraph::new());

    let build_row_id =
        seed_build(
            &graph,
            &database,
            &derivations,
            &destination,
            &local,
            &stepnr,
            std::path::Path::new("/tmp/gcroots"),
            "/nix/store/x.drv",
            "/nix/store/x-out",
        )
        .await;

    let machine = Arc::new(Machine::new(MachineName::new("m1"), ["x86_64-linux".to_string()].into_iter().collect(), 1, 1.0));
    let deps = failing_deps(
        database.clone(),
        destination,
        local,
        vec![machine.clone()],
        RetryConfig { max_tries: 2, retry_interval_secs: 0, retry_backoff: 1.0, jitter_secs: 0 },
    );

    let ran = dispatch_once(&graph, &deps).await.unwrap();
    assert_eq!(ran, 1);
    assert!(!database.get_build(build_row_id).await.unwrap().finished);
    assert_eq!(machine.state.lock().current_jobs, 0);

    let ran = dispatch_once(&graph, &deps).await.unwrap();
    assert_eq!(ran, 1);
    let row = database.get_build(build_row_id).await.unwrap();
    assert!(row.finished);
    assert_eq!(row.build_status, Some(BuildStatus::Aborted.as_i32()));
}

#[tokio::test]
async fn failing_a_dependency_finishes_the_dependent_build_as_dep_failed() {
    let database = Arc::new(FakeDatabase::new());
    let derivations = Arc::new(FakeDerivationStore::new());
    let destination = Arc::new(FakeContentStore::new());
    let local = Arc::new(FakeContentStore::new());
    let stepnr = AtomicI32::new(1);
    let graph = Arc::new(StepGraph::new());

    derivations.seed(DrvPath::new("/nix/store/dep.drv"), drv("/nix/store/dep-out"));
    let mut input_drvs = BTreeMap::new();
    input_drvs.insert(DrvPath::new("/nix/store/dep.drv"), ["out".to_string()].into_iter().collect());
    derivations.seed(
        DrvPath::new("/nix/store/top.drv"),
        BasicDerivation { input_drvs, ..drv("/nix/store/top-out") },
    );

    let jobset = database.get_or_create_jobset("proj", "trunk").await.unwrap();
    let build_row_id = database
        .queue_build(NewBuild {
            jobset_id: jobset.id,
            job: "job".to_string(),
            drv_path: "/nix/store/top.drv".to_string(),
            maxsilent: 0,
            timeout: 0,
            timestamp: 0,
            global_priority: 0,
            priority: 0,
        })
        .await
        .unwrap();
    let ctx = CreateStepCtx {
        database: database.as_ref(),
        derivation_store: derivations.as_ref(),
        local_store: local.as_ref(),
        destination_store: destination.as_ref(),
        stepnr: &stepnr,
        build_id: qr_core::BuildId::new(build_row_id),
        gc_roots_dir: std::path::Path::new("/tmp/gcroots"),
    };
    let crate::step_graph::CreateStepOutcome::Step(top) =
        graph.create_step(&ctx, &DrvPath::new("/nix/store/top.drv"), None).await.unwrap()
    else {
        panic!("expected top step");
    };
    let build = Arc::new(Build::new(
        qr_core::BuildId::new(build_row_id),
        DrvPath::new("/nix/store/top.drv"),
        "proj",
        qr_core::JobsetKey::new("proj", "trunk"),
        "job",
        0,
        0,
        0,
        0,
        0,
        &top,
    ));
    StepGraph::attach_build(&top, &build);
    graph.insert_build(build);
    let dep = graph.get_step(&DrvPath::new("/nix/store/dep.drv")).unwrap();

    let machine = Arc::new(Machine::new(MachineName::new("m1"), ["x86_64-linux".to_string()].into_iter().collect(), 1, 1.0));
    let deps = failing_deps(
        database.clone(),
        destination,
        local,
        vec![machine],
        RetryConfig { max_tries: 1, retry_interval_secs: 0, retry_backoff: 1.0, jitter_secs: 0 },
    );

    // Only the dep is runnable at first; one dispatch pass fails it outright.
    let ran = dispatch_once(&graph, &deps).await.unwrap();
    assert_eq!(ran, 1);

    let row = database.get_build(build_row_id).await.unwrap();
    assert!(row.finished);
    assert_eq!(row.build_status, Some(BuildStatus::DepFailed.as_i32()));
    assert!(matches!(dep.state.lock().status, StepStatus::Done));
    assert!(matches!(top.state.lock().status, StepStatus::Done));
}
