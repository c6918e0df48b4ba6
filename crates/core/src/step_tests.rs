// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::collections::{BTreeMap, BTreeSet};

fn drv() -> BasicDerivation {
    BasicDerivation {
        builder: "/bin/sh".into(),
        args: vec![],
        env: BTreeMap::new(),
        input_srcs: BTreeSet::new(),
        input_drvs: BTreeMap::new(),
        outputs: vec![],
        system: "x86_64-linux".into(),
        required_features: BTreeSet::new(),
        is_deterministic: false,
        prefer_local_build: false,
    }
}

#[test]
fn step_with_no_deps_and_created_is_runnable() {
    let step = Step::new(DrvPath::new("/a.drv"), drv());
    {
        let mut state = step.state.lock();
        state.created = true;
    }
    assert!(step.state.lock().is_runnable());
}

#[test]
fn step_with_outstanding_deps_is_not_runnable_even_if_created() {
    let step = Step::new(DrvPath::new("/a.drv"), drv());
    let mut state = step.state.lock();
    state.created = true;
    state.deps.insert(DrvPath::new("/b.drv"));
    assert!(!state.is_runnable());
}

#[test]
fn priority_propagation_is_monotone_under_max() {
    let step = Step::new(DrvPath::new("/a.drv"), drv());
    let mut state = step.state.lock();
    state.bump_priorities(5, 1, BuildId::new(10));
    state.bump_priorities(2, 9, BuildId::new(3));
    assert_eq!(state.highest_global_priority, 5);
    assert_eq!(state.highest_local_priority, 9);
    assert_eq!(state.lowest_build_id, Some(BuildId::new(3)));
}

#[test]
fn prune_dead_drops_rdeps_with_no_remaining_strong_refs() {
    let rdep = Arc::new(Step::new(DrvPath::new("/rdep.drv"), drv()));
    let step = Step::new(DrvPath::new("/a.drv"), drv());
    {
        let mut state = step.state.lock();
        state.rdeps.push(Arc::downgrade(&rdep));
    }
    drop(rdep);
    let mut state = step.state.lock();
    state.prune_dead();
    assert!(state.rdeps.is_empty());
}

#[test]
fn prefer_local_adds_synthetic_local_feature() {
    let mut d = drv();
    d.prefer_local_build = true;
    d.required_features.insert("kvm".to_string());
    let step = Step::new(DrvPath::new("/a.drv"), d);
    let feats = step.required_features();
    assert!(feats.contains("local"));
    assert!(feats.contains("kvm"));
}
