// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub channel events (§4.1, §6 "Channels").
//!
//! Each variant corresponds 1:1 to a LISTEN/NOTIFY channel name the queue
//! runner and its satellites publish and subscribe to. Serializes with
//! `{"channel": "builds_added", ...}` so a notifier adapter can match on
//! the channel name without re-deriving it from the variant.

use crate::ids::{BuildId, DrvPath};
use serde::{Deserialize, Serialize};

/// Events published on the system's notification channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel")]
pub enum Event {
    /// New builds were queued (§4.1 "a client inserts rows into `Builds`
    /// then notifies `builds_added`").
    #[serde(rename = "builds_added")]
    BuildsAdded,

    /// One or more builds were requeued from a terminal state.
    #[serde(rename = "builds_restarted")]
    BuildsRestarted { build_ids: Vec<BuildId> },

    /// One or more builds were cancelled by a client.
    #[serde(rename = "builds_cancelled")]
    BuildsCancelled { build_ids: Vec<BuildId> },

    /// One or more builds were deleted outright.
    #[serde(rename = "builds_deleted")]
    BuildsDeleted { build_ids: Vec<BuildId> },

    /// A build's priority was bumped after being queued.
    #[serde(rename = "builds_bumped")]
    BuildsBumped { build_ids: Vec<BuildId> },

    /// A jobset's `shares` column changed, affecting dispatcher fairness
    /// accounting (§4.3 step 1).
    #[serde(rename = "jobset_shares_changed")]
    JobsetSharesChanged,

    /// A new jobset was created.
    #[serde(rename = "jobsets_added")]
    JobsetsAdded,

    /// A jobset was deleted.
    #[serde(rename = "jobsets_deleted")]
    JobsetsDeleted,

    /// A jobset's scheduling fields (`enabled`, `checkInterval`, trigger
    /// time) changed.
    #[serde(rename = "jobset_scheduling_changed")]
    JobsetSchedulingChanged,

    /// A build transitioned to "building" (its top-level step became
    /// active).
    #[serde(rename = "build_started")]
    BuildStarted { build_id: BuildId },

    /// A build reached a terminal status.
    #[serde(rename = "build_finished")]
    BuildFinished { build_id: BuildId, status: i32 },

    /// A step was assigned to a Builder Worker.
    #[serde(rename = "step_started")]
    StepStarted { drv_path: DrvPath, machine: String },

    /// A step reached a terminal status, independent of the build(s) that
    /// reference it.
    #[serde(rename = "step_finished")]
    StepFinished { drv_path: DrvPath, status: i32 },

    /// A client requested a diagnostic dump of in-memory state.
    #[serde(rename = "dump_status")]
    DumpStatus,

    /// The diagnostic dump requested by `dump_status` has been written.
    #[serde(rename = "status_dumped")]
    StatusDumped,
}

impl Event {
    /// The channel name this event is published on, matching the
    /// `#[serde(rename = ...)]` tag above (§6 "Channels").
    pub fn channel(&self) -> &'static str {
        match self {
            Event::BuildsAdded => "builds_added",
            Event::BuildsRestarted { .. } => "builds_restarted",
            Event::BuildsCancelled { .. } => "builds_cancelled",
            Event::BuildsDeleted { .. } => "builds_deleted",
            Event::BuildsBumped { .. } => "builds_bumped",
            Event::JobsetSharesChanged => "jobset_shares_changed",
            Event::JobsetsAdded => "jobsets_added",
            Event::JobsetsDeleted => "jobsets_deleted",
            Event::JobsetSchedulingChanged => "jobset_scheduling_changed",
            Event::BuildStarted { .. } => "build_started",
            Event::BuildFinished { .. } => "build_finished",
            Event::StepStarted { .. } => "step_started",
            Event::StepFinished { .. } => "step_finished",
            Event::DumpStatus => "dump_status",
            Event::StatusDumped => "status_dumped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_matches_serde_tag() {
        let event = Event::BuildsRestarted {
            build_ids: vec![BuildId::new(1)],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], event.channel());
    }

    #[test]
    fn unit_variant_round_trips() {
        let json = serde_json::to_string(&Event::BuildsAdded).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Event::BuildsAdded);
    }
}
