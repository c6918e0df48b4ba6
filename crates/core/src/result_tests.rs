// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn only_aborted_is_retryable() {
    for status in [
        BuildStatus::Success,
        BuildStatus::Failed,
        BuildStatus::DepFailed,
        BuildStatus::Cancelled,
        BuildStatus::FailedWithOutput,
        BuildStatus::TimedOut,
        BuildStatus::CachedFailure,
        BuildStatus::Unsupported,
        BuildStatus::LogLimitExceeded,
        BuildStatus::NarSizeLimitExceeded,
        BuildStatus::NotDeterministic,
    ] {
        assert!(!status.can_retry(), "{status:?} should not be retryable");
    }
    assert!(BuildStatus::Aborted.can_retry());
}

#[test]
fn cacheable_statuses_match_spec_table() {
    assert!(BuildStatus::Success.can_cache());
    assert!(BuildStatus::Failed.can_cache());
    assert!(BuildStatus::FailedWithOutput.can_cache());
    assert!(BuildStatus::NotDeterministic.can_cache());

    assert!(!BuildStatus::DepFailed.can_cache());
    assert!(!BuildStatus::Aborted.can_cache());
    assert!(!BuildStatus::Cancelled.can_cache());
    assert!(!BuildStatus::TimedOut.can_cache());
    assert!(!BuildStatus::Unsupported.can_cache());
    assert!(!BuildStatus::LogLimitExceeded.can_cache());
    assert!(!BuildStatus::NarSizeLimitExceeded.can_cache());
}

#[test]
fn i32_round_trip() {
    for raw in 0..=11 {
        let status = BuildStatus::from_i32(raw).expect("valid status");
        assert_eq!(status.as_i32(), raw);
    }
    assert!(BuildStatus::from_i32(99).is_none());
}

#[test]
fn remote_result_new_derives_can_cache_and_can_retry_from_status() {
    let aborted = RemoteResult::new(BuildStatus::Aborted, 0, 1);
    assert!(aborted.can_retry);
    assert!(!aborted.can_cache);

    let success = RemoteResult::new(BuildStatus::Success, 0, 1);
    assert!(!success.can_retry);
    assert!(success.can_cache);
}
