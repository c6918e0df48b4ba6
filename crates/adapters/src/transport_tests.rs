// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::fake::FakeBuilderTransport;
use super::*;
use std::collections::HashSet;

fn machine(name: &str) -> Machine {
    Machine::new(qr_core::MachineName::new(name), HashSet::new(), 1, 1.0)
}

#[tokio::test]
async fn fake_transport_records_connect_attempts() {
    let transport = FakeBuilderTransport::new();
    transport.connect(&machine("builder1")).await.unwrap();
    assert_eq!(*transport.connect_attempts.lock(), vec!["builder1".to_string()]);
}

#[tokio::test]
async fn fake_transport_can_be_configured_to_fail_a_machine() {
    let transport = FakeBuilderTransport::new();
    transport.fail_for("flaky");
    let err = transport.connect(&machine("flaky")).await.unwrap_err();
    assert!(matches!(err, TransportError::ChildExited { .. }));
}
