// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub channel notifications (§6 "Pub/sub channels (listen+notify)").

use async_trait::async_trait;
use qr_core::Event;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscription closed")]
    Closed,
}

/// Publishes and subscribes to the channels named in §6.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn publish(&self, event: Event) -> Result<(), NotifyError>;
    async fn recv(&self) -> Result<Event, NotifyError>;
}

/// `LISTEN`/`NOTIFY`-backed notifier. A dedicated connection outside the
/// pool holds the `LISTEN` sessions for the lifetime of the process (§6
/// "Pub/sub channels"); this type wraps that connection's notification
/// stream behind the `Notifier` port.
pub struct PostgresNotifier {
    listener: tokio::sync::Mutex<sqlx::postgres::PgListener>,
    pool: sqlx::PgPool,
}

impl PostgresNotifier {
    pub async fn connect(database_url: &str) -> Result<Self, NotifyError> {
        let mut listener = sqlx::postgres::PgListener::connect(database_url)
            .await
            .map_err(|e| NotifyError::PublishFailed(e.to_string()))?;
        listener
            .listen_all([
                "builds_added",
                "builds_restarted",
                "builds_cancelled",
                "builds_deleted",
                "builds_bumped",
                "jobset_shares_changed",
                "jobsets_added",
                "jobsets_deleted",
                "jobset_scheduling_changed",
                "build_started",
                "build_finished",
                "step_started",
                "step_finished",
                "dump_status",
                "status_dumped",
            ])
            .await
            .map_err(|e| NotifyError::PublishFailed(e.to_string()))?;

        let pool = sqlx::PgPool::connect(database_url)
            .await
            .map_err(|e| NotifyError::PublishFailed(e.to_string()))?;

        Ok(Self {
            listener: tokio::sync::Mutex::new(listener),
            pool,
        })
    }
}

#[async_trait]
impl Notifier for PostgresNotifier {
    async fn publish(&self, event: Event) -> Result<(), NotifyError> {
        let channel = event.channel();
        let payload = serde_json::to_string(&event).unwrap_or_default();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| NotifyError::PublishFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Event, NotifyError> {
        let mut listener = self.listener.lock().await;
        let notification = listener
            .recv()
            .await
            .map_err(|e| NotifyError::PublishFailed(e.to_string()))?;
        serde_json::from_str(notification.payload()).map_err(|_| NotifyError::Closed)
    }
}

/// In-memory notifier for tests, backed by a `tokio::sync::broadcast`
/// channel (§6 "Pub/sub channels"). Every subscriber sees every published
/// event, matching `LISTEN`'s fan-out semantics.
#[cfg(any(test, feature = "test-support"))]
#[derive(Clone)]
pub struct FakeNotifier {
    tx: broadcast::Sender<Event>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Default for FakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl Notifier for FakeNotifier {
    async fn publish(&self, event: Event) -> Result<(), NotifyError> {
        // No subscribers is not an error: matches Postgres NOTIFY with no
        // active LISTENers.
        self.tx.send(event).ok();
        Ok(())
    }

    async fn recv(&self) -> Result<Event, NotifyError> {
        let mut rx = self.tx.subscribe();
        rx.recv().await.map_err(|_| NotifyError::Closed)
    }
}

#[cfg(test)]
#[path = "notify_tests.rs"]
mod tests;
