// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn published_event_reaches_existing_subscriber() {
    let notifier = FakeNotifier::new();
    let mut rx = notifier.subscribe();

    notifier.publish(Event::BuildsAdded).await.unwrap();

    let received = rx.recv().await.unwrap();
    assert_eq!(received, Event::BuildsAdded);
}

#[tokio::test]
async fn publish_with_no_subscribers_is_not_an_error() {
    let notifier = FakeNotifier::new();
    assert!(notifier.publish(Event::DumpStatus).await.is_ok());
}

#[tokio::test]
async fn multiple_subscribers_each_see_the_event() {
    let notifier = FakeNotifier::new();
    let mut a = notifier.subscribe();
    let mut b = notifier.subscribe();

    notifier
        .publish(Event::BuildStarted { build_id: qr_core::BuildId::new(1) })
        .await
        .unwrap();

    assert_eq!(a.recv().await.unwrap(), Event::BuildStarted { build_id: qr_core::BuildId::new(1) });
    assert_eq!(b.recv().await.unwrap(), Event::BuildStarted { build_id: qr_core::BuildId::new(1) });
}
