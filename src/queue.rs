use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use crate::db::{quote_identifier, table_columns, table_exists, Database};
use crate::error::RowPulseError;
use crate::filter::{new_row_column, FilterPredicate};

pub const DEFAULT_CLAIM_LIMIT: u32 = 100;
pub const DEFAULT_LEASE_SECS: i64 = 300;
pub const DEFAULT_RETRY_DELAY_SECS: i64 = 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Leased,
    Failed,
    Completed,
}

impl QueueStatus {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "leased" => Some(QueueStatus::Leased),
            "failed" => Some(QueueStatus::Failed),
            "completed" => Some(QueueStatus::Completed),
            _ => None,
        }
    }
}

/// A queue row leased to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    /// Primary key of the inserted row as text (a JSON array for composite keys)
    pub item_id: String,
    pub attempts: i64,
    pub max_attempts: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub leased: i64,
    pub failed: i64,
    pub completed: i64,
}

pub fn queue_table_name(alert_id: &str) -> Result<String, RowPulseError> {
    check_alert_id(alert_id)?;
    Ok(format!("_rowpulse_queue_{}", alert_id))
}

pub fn trigger_name(alert_id: &str) -> Result<String, RowPulseError> {
    check_alert_id(alert_id)?;
    Ok(format!("_rowpulse_trigger_{}", alert_id))
}

fn index_name(alert_id: &str) -> Result<String, RowPulseError> {
    Ok(format!("{}_fetch", queue_table_name(alert_id)?))
}

fn check_alert_id(alert_id: &str) -> Result<(), RowPulseError> {
    if alert_id.is_empty() || !alert_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RowPulseError::Validation(format!(
            "Alert id '{}' cannot name a queue table",
            alert_id
        )));
    }
    Ok(())
}

/// Per-alert work queues living inside one target database.
///
/// Rows are enqueued by an `AFTER INSERT` trigger on the watched table, so
/// inserts are captured even while the engine is down. Workers take
/// time-bounded leases; a crashed worker's lease simply expires.
#[derive(Clone)]
pub struct QueueManager {
    db: Database,
}

impl QueueManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the queue table, its fetch index and the insert trigger.
    /// Safe to call repeatedly.
    pub async fn provision(
        &self,
        alert_id: &str,
        table_name: &str,
        pk_columns: &[String],
        filter: &FilterPredicate,
        max_attempts: u32,
    ) -> Result<(), RowPulseError> {
        let alert_id = alert_id.to_string();
        let table_name = table_name.to_string();
        let pk_columns = pk_columns.to_vec();
        let filter = filter.clone();

        self.db
            .write(move |c| {
                provision_immediate(c, &alert_id, &table_name, &pk_columns, &filter, max_attempts)
            })
            .await
    }

    pub async fn teardown(&self, alert_id: &str) -> Result<(), RowPulseError> {
        let queue = quote_identifier(&queue_table_name(alert_id)?)?;
        let trigger = quote_identifier(&trigger_name(alert_id)?)?;
        let alert_id = alert_id.to_string();

        self.db
            .write(move |c| {
                c.execute_batch(&format!(
                    "DROP TRIGGER IF EXISTS {trigger};
                     DROP TABLE IF EXISTS {queue};"
                ))?;
                info!("Removed queue and trigger for alert {}", alert_id);
                Ok(())
            })
            .await
    }

    /// Lease up to `limit` claimable items to `worker_id`, ordered by row id.
    ///
    /// Claimable means pending, leased with an expired lease, or failed with
    /// attempts left and the retry delay elapsed.
    pub async fn claim(
        &self,
        alert_id: &str,
        worker_id: &str,
        limit: u32,
        lease_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, RowPulseError> {
        let queue_name = queue_table_name(alert_id)?;
        let worker_id = worker_id.to_string();
        let now = now.timestamp();

        self.db
            .write(move |c| claim_immediate(c, &queue_name, &worker_id, limit, lease_secs, now))
            .await
    }

    /// Mark items completed. Rows no longer leased by `worker_id` are left
    /// alone. Returns the number of rows completed.
    pub async fn complete(
        &self,
        alert_id: &str,
        ids: &[i64],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, RowPulseError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let queue = quote_identifier(&queue_table_name(alert_id)?)?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE {queue}
             SET status = 'completed', completed_at = ?, lease_until = NULL
             WHERE id IN ({placeholders})
               AND status = 'leased'
               AND leased_by = ?"
        );

        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(ids.len() + 2);
        values.push(now.timestamp().into());
        values.extend(ids.iter().map(|id| rusqlite::types::Value::from(*id)));
        values.push(worker_id.to_string().into());

        self.db
            .write(move |c| Ok(c.execute(&sql, params_from_iter(values))?))
            .await
    }

    /// Mark one item failed and hold it back for `retry_delay_secs`. Has no
    /// effect unless the item is still leased by `worker_id`.
    pub async fn fail(
        &self,
        alert_id: &str,
        id: i64,
        worker_id: &str,
        error: &str,
        retry_delay_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, RowPulseError> {
        let queue = quote_identifier(&queue_table_name(alert_id)?)?;
        let worker_id = worker_id.to_string();
        let error = error.to_string();
        let retry_at = now.timestamp() + retry_delay_secs;

        self.db
            .write(move |c| {
                let updated = c.execute(
                    &format!(
                        "UPDATE {queue}
                         SET status = 'failed', last_error = ?1, lease_until = ?2
                         WHERE id = ?3 AND status = 'leased' AND leased_by = ?4"
                    ),
                    rusqlite::params![error, retry_at, id, worker_id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Item counts per status. `None` when the queue table does not exist.
    pub async fn stats(&self, alert_id: &str) -> Result<Option<QueueStats>, RowPulseError> {
        let queue_name = queue_table_name(alert_id)?;

        self.db
            .interact(move |c| {
                if !table_exists(c, &queue_name)? {
                    return Ok(None);
                }

                let mut stmt = c.prepare(&format!(
                    "SELECT status, count(*) FROM {} GROUP BY status",
                    quote_identifier(&queue_name)?
                ))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut stats = QueueStats::default();
                for (status, count) in rows {
                    match QueueStatus::from_str_opt(&status) {
                        Some(QueueStatus::Pending) => stats.pending = count,
                        Some(QueueStatus::Leased) => stats.leased = count,
                        Some(QueueStatus::Failed) => stats.failed = count,
                        Some(QueueStatus::Completed) => stats.completed = count,
                        None => warn!("Unknown queue status '{}' in {}", status, queue_name),
                    }
                }
                Ok(Some(stats))
            })
            .await
    }
}

/// IMPORTANT: Caller must hold an immediate transaction
fn provision_immediate(
    conn: &Connection,
    alert_id: &str,
    table_name: &str,
    pk_columns: &[String],
    filter: &FilterPredicate,
    max_attempts: u32,
) -> Result<(), RowPulseError> {
    if pk_columns.is_empty() {
        return Err(RowPulseError::Validation(
            "Trigger alert requires at least one primary key column".into(),
        ));
    }

    // Everything interpolated into the DDL is checked against the live schema
    let known = table_columns(conn, table_name)?;
    if known.is_empty() {
        return Err(RowPulseError::NotFound(format!("Table '{}' not found", table_name)));
    }
    for column in pk_columns {
        if !known.iter().any(|k| k == column) {
            return Err(RowPulseError::Validation(format!(
                "Column '{}' not found in table '{}'",
                column, table_name
            )));
        }
    }
    let when = filter.to_trigger_when(&known)?;

    let queue = quote_identifier(&queue_table_name(alert_id)?)?;
    let index = quote_identifier(&index_name(alert_id)?)?;
    let trigger = quote_identifier(&trigger_name(alert_id)?)?;
    let table = quote_identifier(table_name)?;

    let pk_expr = if pk_columns.len() == 1 {
        new_row_column(&pk_columns[0])?
    } else {
        let parts = pk_columns
            .iter()
            .map(|c| new_row_column(c))
            .collect::<Result<Vec<_>, _>>()?;
        format!("json_array({})", parts.join(", "))
    };

    let when_clause = when.map(|w| format!("WHEN {}", w)).unwrap_or_default();

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {queue} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT {max_attempts},
            lease_until INTEGER,
            leased_by TEXT,
            created_at INTEGER NOT NULL DEFAULT (unixepoch()),
            completed_at INTEGER,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS {index} ON {queue} (status, lease_until);

        CREATE TRIGGER IF NOT EXISTS {trigger}
        AFTER INSERT ON {table}
        {when_clause}
        BEGIN
            INSERT INTO {queue} (item_id) VALUES (CAST({pk_expr} AS TEXT));
        END;"
    ))?;

    info!("Provisioned queue for alert {} on table '{}'", alert_id, table_name);
    Ok(())
}

/// IMPORTANT: Caller must hold an immediate transaction
fn claim_immediate(
    conn: &Connection,
    queue_name: &str,
    worker_id: &str,
    limit: u32,
    lease_secs: i64,
    now: i64,
) -> Result<Vec<QueueItem>, RowPulseError> {
    if !table_exists(conn, queue_name)? {
        warn!("Queue table '{}' is missing, nothing to claim", queue_name);
        return Ok(Vec::new());
    }

    let queue = quote_identifier(queue_name)?;
    let mut stmt = conn.prepare(&format!(
        "UPDATE {queue}
         SET status = 'leased',
             lease_until = ?1 + ?2,
             leased_by = ?3,
             attempts = attempts + 1
         WHERE id IN (
             SELECT id FROM {queue}
             WHERE status = 'pending'
                OR (status = 'leased' AND lease_until < ?1)
                OR (status = 'failed' AND attempts < max_attempts AND lease_until < ?1)
             ORDER BY id
             LIMIT ?4
         )
         RETURNING id, item_id, attempts, max_attempts"
    ))?;

    let mut items = stmt
        .query_map(rusqlite::params![now, lease_secs, worker_id, limit], |row| {
            Ok(QueueItem {
                id: row.get(0)?,
                item_id: row.get(1)?,
                attempts: row.get(2)?,
                max_attempts: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // RETURNING order is unspecified
    items.sort_by_key(|item| item.id);

    if !items.is_empty() {
        debug!("Worker {} leased {} item(s) from {}", worker_id, items.len(), queue_name);
    }
    Ok(items)
}
