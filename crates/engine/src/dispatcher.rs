// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The dispatch loop: matches runnable steps to free machine slots (§4.3
//! "doDispatch").
//!
//! Grounded on the reference dispatcher's sort order: machines are tried
//! in `(round(currentJobs/speedFactor), -speedFactor, currentJobs)` order
//! so lightly-loaded, fast machines win ties; runnable steps are tried in
//! `lowestBuildID` order so older builds starve newer ones out, not the
//! reverse.

use qr_core::{Clock, Machine, Step};
use std::sync::Arc;

/// One (step, machine) pairing the dispatcher decided to start.
pub struct Dispatch {
    pub step: Arc<Step>,
    pub machine_index: usize,
}

/// Sorts machine indices into dispatch-preference order (§4.3 step 3),
/// given a provisional extra-jobs overlay so a machine just matched in
/// this same round sorts as more loaded without mutating real state yet.
fn sort_machines(machines: &[Arc<Machine>], extra_jobs: &[u32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..machines.len()).collect();
    indices.sort_by(|&a, &b| {
        let ma = &machines[a];
        let mb = &machines[b];
        let round_a = ((ma.state.lock().current_jobs + extra_jobs[a]) as f64 / ma.speed_factor).round() as i64;
        let round_b = ((mb.state.lock().current_jobs + extra_jobs[b]) as f64 / mb.speed_factor).round() as i64;
        round_a
            .cmp(&round_b)
            .then(mb.speed_factor.partial_cmp(&ma.speed_factor).unwrap_or(std::cmp::Ordering::Equal))
            .then((ma.state.lock().current_jobs + extra_jobs[a]).cmp(&(mb.state.lock().current_jobs + extra_jobs[b])))
    });
    indices
}

/// Sorts runnable steps into dispatch-preference order: oldest
/// (lowest-build-id) builds first, since that's the queue-fairness
/// tiebreaker spec.md hangs priority accounting off of (§3 "Invariants").
fn sort_steps(steps: &[Arc<Step>]) -> Vec<Arc<Step>> {
    let mut sorted = steps.to_vec();
    sorted.sort_by(|a, b| {
        let lid_a = a.state.lock().lowest_build_id;
        let lid_b = b.state.lock().lowest_build_id;
        lid_a.cmp(&lid_b)
    });
    sorted
}

/// One pass of the dispatcher: for each runnable step in `lowestBuildID`
/// order, re-sorts the machines (accounting for matches already made this
/// round) and claims the first available, compatible one, matching the
/// reference dispatcher's "restart the loop after every match" behavior
/// without actually looping over the whole step list again (§4.3 step 4).
///
/// Does not mutate machine or step state — the caller is expected to call
/// the equivalent of `ConnectState::current_jobs += 1` bookkeeping and
/// `StepGraph::mark_active` once it actually starts a builder worker for
/// each returned pairing.
pub fn dispatch_round(runnable: &[Arc<Step>], machines: &[Arc<Machine>], clock: &impl Clock) -> Vec<Dispatch> {
    let steps = sort_steps(runnable);
    let mut extra_jobs = vec![0u32; machines.len()];
    let mut dispatches = Vec::new();

    for step in steps {
        let required_features = step.required_features();
        let machine_order = sort_machines(machines, &extra_jobs);
        let matched = machine_order.into_iter().find(|&idx| {
            let machine = &machines[idx];
            let effective_jobs = machine.state.lock().current_jobs + extra_jobs[idx];
            machine.is_available(clock)
                && effective_jobs < machine.max_jobs
                && machine.supports_step(&step.derivation.system, &required_features)
        });
        if let Some(idx) = matched {
            extra_jobs[idx] += 1;
            dispatches.push(Dispatch { step, machine_index: idx });
        }
    }

    dispatches
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
