//! Fixtures shared by the in-module tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use crate::alerts::{AlertKind, AlertStore, NewAlert, NewSubscription};
use crate::db::Database;
use crate::error::RowPulseError;
use crate::notify::{Notifier, NotifyRequest};

pub fn metadata_store() -> (TempDir, AlertStore) {
    let dir = TempDir::new().unwrap();
    let db = Database::open_metadata(&dir.path().join("rowpulse.db"), 8).unwrap();
    (dir, AlertStore::new(db))
}

/// A target database holding an `events(id, ts, status, amount)` table.
pub fn events_db(dir: &TempDir) -> Database {
    let db = Database::open(&dir.path().join("target.db"), 8).unwrap();
    db.get_connection()
        .unwrap()
        .execute_batch(
            "CREATE TABLE events (
                id INTEGER PRIMARY KEY,
                ts TEXT,
                status TEXT,
                amount REAL
            );",
        )
        .unwrap();
    db
}

pub fn insert_event(db: &Database, id: i64, ts: &str, status: &str) {
    db.get_connection()
        .unwrap()
        .execute(
            "INSERT INTO events (id, ts, status, amount) VALUES (?, ?, ?, 1.5)",
            rusqlite::params![id, ts, status],
        )
        .unwrap();
}

pub fn cursor_alert(database_name: &str, table_name: &str) -> NewAlert {
    NewAlert {
        database_name: database_name.into(),
        table_name: table_name.into(),
        alert_kind: AlertKind::Cursor,
        id_columns: vec!["id".into()],
        timestamp_column: Some("ts".into()),
        frequency: Some("+1 minute".into()),
        subscriptions: vec![NewSubscription {
            notifier_slug: "slack".into(),
            config: json!({"webhook_url": "http://localhost/hook"}),
        }],
        ..Default::default()
    }
}

pub fn trigger_alert(database_name: &str, table_name: &str) -> NewAlert {
    NewAlert {
        database_name: database_name.into(),
        table_name: table_name.into(),
        alert_kind: AlertKind::Trigger,
        id_columns: vec!["id".into()],
        subscriptions: vec![NewSubscription {
            notifier_slug: "slack".into(),
            config: json!({"webhook_url": "http://localhost/hook"}),
        }],
        ..Default::default()
    }
}

/// Test channel that records every request it receives
pub struct RecordingNotifier {
    slug: String,
    sent: Mutex<Vec<NotifyRequest>>,
}

impl RecordingNotifier {
    pub fn new(slug: &str) -> Arc<Self> {
        Arc::new(Self {
            slug: slug.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<NotifyRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn name(&self) -> &str {
        "Recording"
    }

    async fn send(&self, request: &NotifyRequest) -> Result<(), RowPulseError> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Test channel that always fails
pub struct FailingNotifier {
    slug: String,
    calls: AtomicUsize,
}

impl FailingNotifier {
    pub fn new(slug: &str) -> Arc<Self> {
        Arc::new(Self {
            slug: slug.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for FailingNotifier {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn name(&self) -> &str {
        "Failing"
    }

    async fn send(&self, _request: &NotifyRequest) -> Result<(), RowPulseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RowPulseError::Delivery("channel down".into()))
    }
}

/// Test channel that never finishes within a short timeout
pub struct StalledNotifier;

#[async_trait]
impl Notifier for StalledNotifier {
    fn slug(&self) -> &str {
        "stalled"
    }

    fn name(&self) -> &str {
        "Stalled"
    }

    async fn send(&self, _request: &NotifyRequest) -> Result<(), RowPulseError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(())
    }
}
