// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use qr_core::{BasicDerivation, DrvPath, FakeClock, MachineName, Step};
use std::collections::{BTreeMap, BTreeSet};

fn machine(name: &str, max_jobs: u32, speed_factor: f64, systems: &[&str]) -> Arc<Machine> {
    Arc::new(Machine::new(
        MachineName::new(name),
        systems.iter().map(|s| s.to_string()).collect(),
        max_jobs,
        speed_factor,
    ))
}

fn step(system: &str) -> Arc<Step> {
    Arc::new(Step::new(
        DrvPath::new(format!("/nix/store/{system}.drv")),
        BasicDerivation {
            builder: "/bin/sh".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            input_srcs: BTreeSet::new(),
            input_drvs: BTreeMap::new(),
            outputs: vec![],
            system: system.to_string(),
            required_features: BTreeSet::new(),
            is_deterministic: false,
            prefer_local_build: false,
        },
    ))
}

#[test]
fn prefers_the_lightly_loaded_machine() {
    let clock = FakeClock::new();
    let busy = machine("busy", 4, 1.0, &["x86_64-linux"]);
    busy.state.lock().current_jobs = 3;
    let idle = machine("idle", 4, 1.0, &["x86_64-linux"]);
    let machines = vec![busy.clone(), idle.clone()];

    let s = step("x86_64-linux");
    let dispatches = dispatch_round(&[s], &machines, &clock);

    assert_eq!(dispatches.len(), 1);
    assert_eq!(machines[dispatches[0].machine_index].name, idle.name);
}

#[test]
fn skips_machines_that_dont_support_the_system() {
    let clock = FakeClock::new();
    let m = machine("m1", 1, 1.0, &["aarch64-linux"]);
    let machines = vec![m];

    let s = step("x86_64-linux");
    let dispatches = dispatch_round(&[s], &machines, &clock);

    assert!(dispatches.is_empty());
}

#[test]
fn each_step_claims_a_distinct_slot_within_a_round() {
    let clock = FakeClock::new();
    let m = machine("m1", 1, 1.0, &["x86_64-linux"]);
    let machines = vec![m];

    let s1 = step("x86_64-linux");
    let s2 = step("x86_64-linux");
    let dispatches = dispatch_round(&[s1, s2], &machines, &clock);

    assert_eq!(dispatches.len(), 1);
}

#[test]
fn disabled_machines_are_never_matched() {
    let clock = FakeClock::new();
    let m = machine("m1", 4, 1.0, &["x86_64-linux"]);
    m.state.lock().disabled_until = Some(clock.now() + std::time::Duration::from_secs(60));
    let machines = vec![m];

    let s = step("x86_64-linux");
    let dispatches = dispatch_round(&[s], &machines, &clock);

    assert!(dispatches.is_empty());
}
