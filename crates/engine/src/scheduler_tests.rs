// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn timer_fires_once_deadline_passes() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();
    scheduler.set_timer(TimerId::new("retry:m1"), Duration::from_secs(10), now);
    assert!(scheduler.fired_timers(now).is_empty());
    assert!(scheduler.fired_timers(now + Duration::from_secs(11)).len() == 1);
    assert!(!scheduler.has_timers());
}

#[test]
fn cancelling_a_timer_prevents_it_firing() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();
    let id = TimerId::new("machines-poll");
    scheduler.set_timer(id.clone(), Duration::from_secs(1), now);
    scheduler.cancel_timer(&id);
    assert!(scheduler.fired_timers(now + Duration::from_secs(2)).is_empty());
}

#[test]
fn next_deadline_is_the_earliest_pending_timer() {
    let mut scheduler = Scheduler::new();
    let now = Instant::now();
    scheduler.set_timer(TimerId::new("a"), Duration::from_secs(30), now);
    scheduler.set_timer(TimerId::new("b"), Duration::from_secs(5), now);
    assert_eq!(scheduler.next_deadline(), Some(now + Duration::from_secs(5)));
}
