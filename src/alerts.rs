use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::db::Database;
use crate::error::RowPulseError;
use crate::filter::FilterPredicate;
use crate::frequency::Frequency;
use crate::utils::Utils;

const DETAIL_LOG_LIMIT: i64 = 20;
const DEFAULT_CREATOR: &str = "rowpulse";

/// Detection strategy of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    #[default]
    Cursor,
    Trigger,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Cursor => "cursor",
            AlertKind::Trigger => "trigger",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "cursor" => Some(AlertKind::Cursor),
            "trigger" => Some(AlertKind::Trigger),
            _ => None,
        }
    }

    fn parse(s: &str) -> Result<Self, RowPulseError> {
        Self::from_str_opt(s)
            .ok_or_else(|| RowPulseError::Error(format!("Invalid alert kind '{}'", s)))
    }
}

fn default_config() -> Value {
    Value::Object(Default::default())
}

/// Subscription supplied with a creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub notifier_slug: String,
    #[serde(default = "default_config")]
    pub config: Value,
}

/// Parameters for creating a new alert
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAlert {
    pub database_name: String,
    pub table_name: String,
    #[serde(default)]
    pub alert_kind: AlertKind,
    #[serde(default)]
    pub id_columns: Vec<String>,

    // cursor alerts
    #[serde(default)]
    pub timestamp_column: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,

    // trigger alerts
    #[serde(default)]
    pub filter: FilterPredicate,

    #[serde(default)]
    pub subscriptions: Vec<NewSubscription>,
    #[serde(default)]
    pub creator_id: Option<String>,
}

impl NewAlert {
    /// Check that the fields required by `alert_kind` are present and well
    /// formed. Returns the parsed frequency for cursor alerts.
    pub fn validate(&self) -> Result<Option<Frequency>, RowPulseError> {
        if self.database_name.trim().is_empty() {
            return Err(RowPulseError::Validation("database_name is required".into()));
        }
        if self.table_name.trim().is_empty() {
            return Err(RowPulseError::Validation("table_name is required".into()));
        }
        if self.id_columns.is_empty() {
            return Err(RowPulseError::Validation(
                "At least one identifier column is required".into(),
            ));
        }
        if self.id_columns.iter().any(|c| c.trim().is_empty()) {
            return Err(RowPulseError::Validation(
                "Identifier column names cannot be blank".into(),
            ));
        }
        for sub in &self.subscriptions {
            validate_subscription(&sub.notifier_slug, &sub.config)?;
        }

        match self.alert_kind {
            AlertKind::Cursor => {
                match self.timestamp_column.as_deref() {
                    Some(col) if !col.trim().is_empty() => {}
                    _ => {
                        return Err(RowPulseError::Validation(
                            "Cursor alert requires timestamp_column".into(),
                        ))
                    }
                }
                if !self.filter.is_empty() {
                    return Err(RowPulseError::Validation(
                        "Cursor alert should not have a filter".into(),
                    ));
                }
                let frequency = self
                    .frequency
                    .as_deref()
                    .ok_or_else(|| {
                        RowPulseError::Validation("Cursor alert requires frequency".into())
                    })?
                    .parse::<Frequency>()?;
                Ok(Some(frequency))
            }
            AlertKind::Trigger => {
                if self.timestamp_column.is_some() || self.frequency.is_some() {
                    return Err(RowPulseError::Validation(
                        "Trigger alert should not have timestamp_column or frequency".into(),
                    ));
                }
                Ok(None)
            }
        }
    }

    /// Every column of the target table this alert refers to
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.id_columns.iter().map(String::as_str).collect();
        if let Some(ts) = self.timestamp_column.as_deref() {
            columns.push(ts);
        }
        columns.extend(self.filter.columns());
        columns
    }
}

fn validate_subscription(slug: &str, config: &Value) -> Result<(), RowPulseError> {
    if slug.trim().is_empty() {
        return Err(RowPulseError::Validation("Notifier slug cannot be empty".into()));
    }
    if !config.is_object() {
        return Err(RowPulseError::Validation(format!(
            "Configuration for '{}' must be a JSON object",
            slug
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub alert_id: String,
    pub notifier: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertLogEntry {
    pub log_id: i64,
    pub logged_at: String,
    pub new_ids: Vec<Value>,
    pub cursor: Value,
}

/// A claimed cursor alert, ready for one detection tick
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyJob {
    pub alert_id: String,
    pub database_name: String,
    pub table_name: String,
    pub id_columns: Vec<String>,
    pub timestamp_column: String,
    /// Watermark from the most recent log entry (`Null` if none)
    pub cursor: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerAlert {
    pub alert_id: String,
    pub database_name: String,
    pub table_name: String,
    pub id_columns: Vec<String>,
}

/// What the caller needs to tear down after deleting an alert
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedAlert {
    pub alert_kind: AlertKind,
    pub database_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    pub alert_id: String,
    pub database_name: String,
    pub table_name: String,
    pub alert_kind: AlertKind,
    pub frequency: Option<String>,
    pub next_deadline: Option<String>,
    pub alert_created_at: String,
    pub seconds_until_next: Option<i64>,
    pub notifiers: Vec<String>,
    pub last_notification_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertDetail {
    pub alert_id: String,
    pub alert_creator_id: String,
    pub alert_created_at: String,
    pub database_name: String,
    pub table_name: String,
    pub alert_kind: AlertKind,
    pub id_columns: Vec<String>,
    pub timestamp_column: Option<String>,
    pub frequency: Option<String>,
    pub next_deadline: Option<String>,
    pub current_schedule_started_at: Option<String>,
    pub seconds_until_next: Option<i64>,
    pub filter: FilterPredicate,
    pub subscriptions: Vec<Subscription>,
    /// Most recent first
    pub logs: Vec<AlertLogEntry>,
}

fn seconds_until(deadline: Option<&str>, now: DateTime<Utc>) -> Option<i64> {
    deadline
        .and_then(|d| Utils::parse_sql_timestamp(d).ok())
        .map(|d| (d - now).num_seconds())
}

/// Access layer over the metadata store. Every public operation runs as one
/// immediate transaction on the blocking pool.
#[derive(Clone)]
pub struct AlertStore {
    db: Database,
}

impl AlertStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an alert, its subscriptions and, for cursor alerts, a seed log
    /// entry carrying `seed_cursor` so the first tick only sees later rows.
    pub async fn create_alert(
        &self,
        params: NewAlert,
        seed_cursor: Value,
        now: DateTime<Utc>,
    ) -> Result<String, RowPulseError> {
        let frequency = params.validate()?;
        self.db
            .write(move |c| create_alert_immediate(c, &params, frequency, &seed_cursor, now))
            .await
    }

    /// Returns `None` when the alert does not exist.
    pub async fn delete_alert(&self, alert_id: &str) -> Result<Option<DeletedAlert>, RowPulseError> {
        let alert_id = alert_id.to_string();
        self.db
            .write(move |c| delete_alert_immediate(c, &alert_id))
            .await
    }

    pub async fn list_alerts(
        &self,
        database_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertSummary>, RowPulseError> {
        let database_name = database_name.to_string();
        self.db
            .interact(move |c| list_alerts_for_database(c, &database_name, now))
            .await
    }

    pub async fn get_alert_detail(
        &self,
        alert_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDetail>, RowPulseError> {
        let alert_id = alert_id.to_string();
        self.db
            .interact(move |c| get_alert_detail(c, &alert_id, now))
            .await
    }

    pub async fn add_subscription(
        &self,
        alert_id: &str,
        notifier_slug: &str,
        config: Value,
    ) -> Result<String, RowPulseError> {
        validate_subscription(notifier_slug, &config)?;
        let alert_id = alert_id.to_string();
        let notifier_slug = notifier_slug.to_string();

        self.db
            .write(move |c| {
                let exists: bool = c.query_row(
                    "SELECT EXISTS (SELECT 1 FROM alerts WHERE alert_id = ?)",
                    [&alert_id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(RowPulseError::NotFound(format!(
                        "Alert '{}' not found",
                        alert_id
                    )));
                }
                insert_subscription(c, &alert_id, &notifier_slug, &config)
            })
            .await
    }

    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        config: Value,
    ) -> Result<(), RowPulseError> {
        if !config.is_object() {
            return Err(RowPulseError::Validation(
                "Subscription configuration must be a JSON object".into(),
            ));
        }
        let subscription_id = subscription_id.to_string();

        self.db
            .write(move |c| {
                let updated = c.execute(
                    "UPDATE alert_subscriptions SET config = ? WHERE subscription_id = ?",
                    params![config.to_string(), subscription_id],
                )?;
                if updated == 0 {
                    return Err(RowPulseError::NotFound(format!(
                        "Subscription '{}' not found",
                        subscription_id
                    )));
                }
                Ok(())
            })
            .await
    }

    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<(), RowPulseError> {
        let subscription_id = subscription_id.to_string();

        self.db
            .write(move |c| {
                let deleted = c.execute(
                    "DELETE FROM alert_subscriptions WHERE subscription_id = ?",
                    [&subscription_id],
                )?;
                if deleted == 0 {
                    return Err(RowPulseError::NotFound(format!(
                        "Subscription '{}' not found",
                        subscription_id
                    )));
                }
                Ok(())
            })
            .await
    }

    pub async fn alert_subscriptions(&self, alert_id: &str) -> Result<Vec<Subscription>, RowPulseError> {
        let alert_id = alert_id.to_string();
        self.db
            .interact(move |c| subscriptions_for_alert(c, &alert_id))
            .await
    }

    /// Lock and return every due cursor alert.
    ///
    /// The conditional `UPDATE ... RETURNING` runs under `BEGIN IMMEDIATE`,
    /// so concurrent callers can never both claim the same alert.
    pub async fn claim_due_cursor_alerts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReadyJob>, RowPulseError> {
        self.db
            .write(move |c| claim_due_cursor_alerts_immediate(c, now))
            .await
    }

    /// Append a log entry and, for cursor alerts, release the lock and re-arm
    /// the deadline, all in one transaction.
    pub async fn record_tick(
        &self,
        alert_id: &str,
        new_ids: Vec<Value>,
        cursor: Value,
        now: DateTime<Utc>,
    ) -> Result<(), RowPulseError> {
        let alert_id = alert_id.to_string();
        self.db
            .write(move |c| {
                let kind = alert_kind_locked(c, &alert_id)?;
                insert_log(c, &alert_id, &new_ids, &cursor, now)?;
                if kind == AlertKind::Cursor {
                    rearm_locked(c, &alert_id, now)?;
                }
                Ok(())
            })
            .await
    }

    /// Release the lock and re-arm the deadline without logging a tick, used
    /// when detection could not run. The watermark is left untouched.
    pub async fn reschedule(&self, alert_id: &str, now: DateTime<Utc>) -> Result<(), RowPulseError> {
        let alert_id = alert_id.to_string();
        self.db
            .write(move |c| rearm_locked(c, &alert_id, now))
            .await
    }

    /// Clear tick locks taken before `older_than`, so a tick abandoned by a
    /// crashed worker is picked up again at its next deadline.
    pub async fn release_stale_locks(&self, older_than: DateTime<Utc>) -> Result<usize, RowPulseError> {
        let cutoff = Utils::to_sql_timestamp(older_than);
        let released = self
            .db
            .write(move |c| {
                Ok(c.execute(
                    "UPDATE alerts SET current_schedule_started_at = NULL
                     WHERE alert_kind = 'cursor'
                       AND current_schedule_started_at IS NOT NULL
                       AND current_schedule_started_at < ?",
                    [&cutoff],
                )?)
            })
            .await?;

        if released > 0 {
            warn!("Released {} stale cursor alert lock(s)", released);
        }
        Ok(released)
    }

    pub async fn list_trigger_alerts(&self) -> Result<Vec<TriggerAlert>, RowPulseError> {
        self.db.interact(list_trigger_alerts).await
    }
}

// ========================================
// Blocking operations
// ========================================

/// IMPORTANT: Caller must hold an immediate transaction
fn create_alert_immediate(
    conn: &Connection,
    params: &NewAlert,
    frequency: Option<Frequency>,
    seed_cursor: &Value,
    now: DateTime<Utc>,
) -> Result<String, RowPulseError> {
    let alert_id = Uuid::new_v4().simple().to_string();
    let created_at = Utils::to_sql_timestamp(now);
    let creator = params.creator_id.as_deref().unwrap_or(DEFAULT_CREATOR);
    let id_columns = serde_json::to_string(&params.id_columns)?;

    match params.alert_kind {
        AlertKind::Cursor => {
            let frequency = frequency.ok_or_else(|| {
                RowPulseError::Validation("Cursor alert requires frequency".into())
            })?;
            let next_deadline = Utils::to_sql_timestamp(frequency.next_after(now)?);

            conn.execute(
                "INSERT INTO alerts (
                    alert_id, alert_creator_id, alert_created_at, database_name, table_name,
                    id_columns, timestamp_column, frequency, next_deadline, alert_kind
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    alert_id,
                    creator,
                    created_at,
                    params.database_name,
                    params.table_name,
                    id_columns,
                    params.timestamp_column,
                    frequency.to_string(),
                    next_deadline,
                    AlertKind::Cursor.as_str(),
                ],
            )?;
        }
        AlertKind::Trigger => {
            let filter_params = if params.filter.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&params.filter)?)
            };

            conn.execute(
                "INSERT INTO alerts (
                    alert_id, alert_creator_id, alert_created_at, database_name, table_name,
                    id_columns, alert_kind, filter_params
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    alert_id,
                    creator,
                    created_at,
                    params.database_name,
                    params.table_name,
                    id_columns,
                    AlertKind::Trigger.as_str(),
                    filter_params,
                ],
            )?;
        }
    }

    for sub in &params.subscriptions {
        insert_subscription(conn, &alert_id, &sub.notifier_slug, &sub.config)?;
    }

    if params.alert_kind == AlertKind::Cursor {
        insert_log(conn, &alert_id, &[], seed_cursor, now)?;
    }

    info!(
        "Created {} alert {} on {}.{}",
        params.alert_kind.as_str(),
        alert_id,
        params.database_name,
        params.table_name
    );

    Ok(alert_id)
}

/// IMPORTANT: Caller must hold an immediate transaction
fn delete_alert_immediate(
    conn: &Connection,
    alert_id: &str,
) -> Result<Option<DeletedAlert>, RowPulseError> {
    let row = conn
        .query_row(
            "SELECT alert_kind, database_name, table_name FROM alerts WHERE alert_id = ?",
            [alert_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let (kind, database_name, table_name) = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    conn.execute("DELETE FROM alert_logs WHERE alert_id = ?", [alert_id])?;
    conn.execute("DELETE FROM alert_subscriptions WHERE alert_id = ?", [alert_id])?;
    conn.execute("DELETE FROM alerts WHERE alert_id = ?", [alert_id])?;

    info!("Deleted alert {}", alert_id);

    Ok(Some(DeletedAlert {
        alert_kind: AlertKind::parse(&kind)?,
        database_name,
        table_name,
    }))
}

fn insert_subscription(
    conn: &Connection,
    alert_id: &str,
    notifier_slug: &str,
    config: &Value,
) -> Result<String, RowPulseError> {
    let subscription_id = Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO alert_subscriptions (subscription_id, alert_id, notifier, config)
         VALUES (?, ?, ?, ?)",
        params![subscription_id, alert_id, notifier_slug, config.to_string()],
    )?;
    Ok(subscription_id)
}

fn insert_log(
    conn: &Connection,
    alert_id: &str,
    new_ids: &[Value],
    cursor: &Value,
    now: DateTime<Utc>,
) -> Result<(), RowPulseError> {
    conn.execute(
        "INSERT INTO alert_logs (alert_id, logged_at, new_ids, cursor) VALUES (?, ?, ?, ?)",
        params![
            alert_id,
            Utils::to_sql_timestamp(now),
            serde_json::to_string(new_ids)?,
            Utils::json_to_sql(cursor),
        ],
    )?;
    Ok(())
}

fn alert_kind_locked(conn: &Connection, alert_id: &str) -> Result<AlertKind, RowPulseError> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT alert_kind FROM alerts WHERE alert_id = ?",
            [alert_id],
            |row| row.get(0),
        )
        .optional()?;

    match kind {
        Some(k) => AlertKind::parse(&k),
        None => Err(RowPulseError::NotFound(format!("Alert '{}' not found", alert_id))),
    }
}

/// Clear the tick lock and set `next_deadline = now + frequency`.
fn rearm_locked(conn: &Connection, alert_id: &str, now: DateTime<Utc>) -> Result<(), RowPulseError> {
    let frequency: Option<Option<String>> = conn
        .query_row(
            "SELECT frequency FROM alerts WHERE alert_id = ? AND alert_kind = 'cursor'",
            [alert_id],
            |row| row.get(0),
        )
        .optional()?;

    let frequency = frequency
        .ok_or_else(|| RowPulseError::NotFound(format!("Cursor alert '{}' not found", alert_id)))?
        .ok_or_else(|| RowPulseError::Error(format!("Alert '{}' has no frequency", alert_id)))?
        .parse::<Frequency>()?;

    let next_deadline = Utils::to_sql_timestamp(frequency.next_after(now)?);

    conn.execute(
        "UPDATE alerts SET next_deadline = ?, current_schedule_started_at = NULL
         WHERE alert_id = ?",
        params![next_deadline, alert_id],
    )?;

    debug!("Alert {} next deadline {}", alert_id, next_deadline);
    Ok(())
}

fn latest_cursor(conn: &Connection, alert_id: &str) -> Result<Value, RowPulseError> {
    let cursor = conn
        .query_row(
            "SELECT cursor FROM alert_logs WHERE alert_id = ? ORDER BY log_id DESC LIMIT 1",
            [alert_id],
            |row| Ok(Utils::sql_to_json(row.get_ref(0)?)),
        )
        .optional()?;

    Ok(cursor.unwrap_or(Value::Null))
}

/// IMPORTANT: Caller must hold an immediate transaction
fn claim_due_cursor_alerts_immediate(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<ReadyJob>, RowPulseError> {
    let now_s = Utils::to_sql_timestamp(now);

    let claimed: Vec<(String, String, String, String, Option<String>)> = {
        let mut stmt = conn.prepare(
            "UPDATE alerts
             SET current_schedule_started_at = ?1
             WHERE alert_kind = 'cursor'
               AND next_deadline <= ?1
               AND current_schedule_started_at IS NULL
             RETURNING alert_id, database_name, table_name, id_columns, timestamp_column",
        )?;
        let rows = stmt
            .query_map([&now_s], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut jobs = Vec::with_capacity(claimed.len());
    for (alert_id, database_name, table_name, id_columns, timestamp_column) in claimed {
        let cursor = latest_cursor(conn, &alert_id)?;
        jobs.push(ReadyJob {
            id_columns: serde_json::from_str(&id_columns)?,
            timestamp_column: timestamp_column.unwrap_or_default(),
            alert_id,
            database_name,
            table_name,
            cursor,
        });
    }

    if !jobs.is_empty() {
        debug!("Claimed {} due cursor alert(s)", jobs.len());
    }

    Ok(jobs)
}

fn subscriptions_for_alert(conn: &Connection, alert_id: &str) -> Result<Vec<Subscription>, RowPulseError> {
    let mut stmt = conn.prepare(
        "SELECT subscription_id, alert_id, notifier, config
         FROM alert_subscriptions
         WHERE alert_id = ?
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([alert_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(subscription_id, alert_id, notifier, config)| {
            Ok(Subscription {
                subscription_id,
                alert_id,
                notifier,
                config: serde_json::from_str(&config)?,
            })
        })
        .collect()
}

fn list_trigger_alerts(conn: &Connection) -> Result<Vec<TriggerAlert>, RowPulseError> {
    let mut stmt = conn.prepare(
        "SELECT alert_id, database_name, table_name, id_columns
         FROM alerts
         WHERE alert_kind = 'trigger'
         ORDER BY alert_created_at, alert_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(alert_id, database_name, table_name, id_columns)| {
            Ok(TriggerAlert {
                alert_id,
                database_name,
                table_name,
                id_columns: serde_json::from_str(&id_columns)?,
            })
        })
        .collect()
}

fn list_alerts_for_database(
    conn: &Connection,
    database_name: &str,
    now: DateTime<Utc>,
) -> Result<Vec<AlertSummary>, RowPulseError> {
    let mut stmt = conn.prepare(
        "SELECT
            a.alert_id,
            a.database_name,
            a.table_name,
            a.alert_kind,
            a.frequency,
            a.next_deadline,
            a.alert_created_at,
            (SELECT group_concat(DISTINCT s.notifier)
             FROM alert_subscriptions s
             WHERE s.alert_id = a.alert_id) AS notifiers,
            (SELECT max(l.logged_at)
             FROM alert_logs l
             WHERE l.alert_id = a.alert_id
               AND json_array_length(l.new_ids) > 0) AS last_notification_at
         FROM alerts a
         WHERE a.database_name = ?
         ORDER BY a.alert_created_at DESC, a.alert_id",
    )?;

    let rows = stmt
        .query_map([database_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(
                alert_id,
                database_name,
                table_name,
                kind,
                frequency,
                next_deadline,
                alert_created_at,
                notifiers,
                last_notification_at,
            )| {
                let mut notifiers: Vec<String> = notifiers
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                notifiers.sort();

                Ok(AlertSummary {
                    seconds_until_next: seconds_until(next_deadline.as_deref(), now),
                    alert_kind: AlertKind::parse(&kind)?,
                    alert_id,
                    database_name,
                    table_name,
                    frequency,
                    next_deadline,
                    alert_created_at,
                    notifiers,
                    last_notification_at,
                })
            },
        )
        .collect()
}

fn get_alert_detail(
    conn: &Connection,
    alert_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<AlertDetail>, RowPulseError> {
    type DetailRow = (
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
    );

    let row: Option<DetailRow> = conn
        .query_row(
            "SELECT alert_id, alert_creator_id, alert_created_at, database_name, table_name,
                    alert_kind, id_columns, timestamp_column, frequency, next_deadline,
                    current_schedule_started_at, filter_params
             FROM alerts
             WHERE alert_id = ?",
            [alert_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                ))
            },
        )
        .optional()?;

    let Some((
        alert_id,
        alert_creator_id,
        alert_created_at,
        database_name,
        table_name,
        kind,
        id_columns,
        timestamp_column,
        frequency,
        next_deadline,
        current_schedule_started_at,
        filter_params,
    )) = row
    else {
        return Ok(None);
    };

    let filter = match filter_params.as_deref() {
        Some(json) => serde_json::from_str(json)?,
        None => FilterPredicate::default(),
    };

    let mut stmt = conn.prepare(
        "SELECT log_id, logged_at, new_ids, cursor
         FROM alert_logs
         WHERE alert_id = ?
         ORDER BY log_id DESC
         LIMIT ?",
    )?;
    let raw_logs = stmt
        .query_map(params![alert_id, DETAIL_LOG_LIMIT], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                Utils::sql_to_json(row.get_ref(3)?),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let logs = raw_logs
        .into_iter()
        .map(|(log_id, logged_at, new_ids, cursor)| {
            Ok(AlertLogEntry {
                log_id,
                logged_at,
                new_ids: serde_json::from_str(&new_ids)?,
                cursor,
            })
        })
        .collect::<Result<Vec<_>, RowPulseError>>()?;

    Ok(Some(AlertDetail {
        subscriptions: subscriptions_for_alert(conn, &alert_id)?,
        seconds_until_next: seconds_until(next_deadline.as_deref(), now),
        alert_kind: AlertKind::parse(&kind)?,
        id_columns: serde_json::from_str(&id_columns)?,
        alert_id,
        alert_creator_id,
        alert_created_at,
        database_name,
        table_name,
        timestamp_column,
        frequency,
        next_deadline,
        current_schedule_started_at,
        filter,
        logs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterClause, FilterOp};
    use crate::test_support::{cursor_alert, metadata_store, trigger_alert};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_validate_cursor_alert() {
        let alert = cursor_alert("db", "events");
        assert!(alert.validate().unwrap().is_some());

        let mut missing_ts = alert.clone();
        missing_ts.timestamp_column = None;
        assert!(matches!(missing_ts.validate(), Err(RowPulseError::Validation(_))));

        let mut bad_freq = alert.clone();
        bad_freq.frequency = Some("sometimes".into());
        assert!(matches!(bad_freq.validate(), Err(RowPulseError::Validation(_))));

        let mut no_ids = alert.clone();
        no_ids.id_columns.clear();
        assert!(matches!(no_ids.validate(), Err(RowPulseError::Validation(_))));

        let mut bad_config = alert;
        bad_config.subscriptions = vec![NewSubscription {
            notifier_slug: "slack".into(),
            config: json!("not an object"),
        }];
        assert!(matches!(bad_config.validate(), Err(RowPulseError::Validation(_))));
    }

    #[test]
    fn test_validate_trigger_alert() {
        let alert = trigger_alert("db", "events");
        assert!(alert.validate().unwrap().is_none());

        let mut with_freq = alert;
        with_freq.frequency = Some("+1 minute".into());
        assert!(matches!(with_freq.validate(), Err(RowPulseError::Validation(_))));
    }

    #[test]
    fn test_new_alert_deserializes_with_defaults() {
        let alert: NewAlert = serde_json::from_str(
            r#"{
                "database_name": "db",
                "table_name": "orders",
                "alert_kind": "trigger",
                "id_columns": ["id"],
                "filter": [["status__exact", "active"]],
                "subscriptions": [{"notifier_slug": "slack"}]
            }"#,
        )
        .unwrap();
        assert_eq!(alert.alert_kind, AlertKind::Trigger);
        assert_eq!(alert.filter.clauses(), &[FilterClause::new("status", FilterOp::Exact, "active")]);
        assert_eq!(alert.subscriptions[0].config, json!({}));
        assert!(alert.validate().is_ok());
    }

    #[tokio::test]
    async fn test_create_cursor_alert_seeds_log_and_deadline() {
        let (_dir, store) = metadata_store();
        let id = store
            .create_alert(cursor_alert("db", "events"), json!("2024-01-01"), t0())
            .await
            .unwrap();

        let detail = store.get_alert_detail(&id, t0()).await.unwrap().unwrap();
        assert_eq!(detail.alert_kind, AlertKind::Cursor);
        assert_eq!(detail.frequency.as_deref(), Some("+1 minutes"));
        assert_eq!(detail.next_deadline.as_deref(), Some("2024-01-01 12:01:00"));
        assert_eq!(detail.seconds_until_next, Some(60));
        assert_eq!(detail.current_schedule_started_at, None);
        assert_eq!(detail.subscriptions.len(), 1);
        assert_eq!(detail.logs.len(), 1);
        assert_eq!(detail.logs[0].cursor, json!("2024-01-01"));
        assert!(detail.logs[0].new_ids.is_empty());
    }

    #[tokio::test]
    async fn test_create_trigger_alert_has_no_seed_log() {
        let (_dir, store) = metadata_store();
        let mut params = trigger_alert("db", "events");
        params.filter = FilterPredicate::new(vec![FilterClause::new("status", FilterOp::Exact, "active")]);
        let id = store.create_alert(params, Value::Null, t0()).await.unwrap();

        let detail = store.get_alert_detail(&id, t0()).await.unwrap().unwrap();
        assert_eq!(detail.alert_kind, AlertKind::Trigger);
        assert!(detail.logs.is_empty());
        assert_eq!(detail.next_deadline, None);
        assert_eq!(detail.filter.clauses().len(), 1);

        let triggers = store.list_trigger_alerts().await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].alert_id, id);
        assert_eq!(triggers[0].id_columns, vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn test_create_alert_rejects_invalid_params() {
        let (_dir, store) = metadata_store();
        let mut params = cursor_alert("db", "events");
        params.frequency = None;
        let err = store.create_alert(params, Value::Null, t0()).await.unwrap_err();
        assert!(matches!(err, RowPulseError::Validation(_)));
        assert!(store.list_alerts("db", t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_alert_returns_info_and_removes_children() {
        let (_dir, store) = metadata_store();
        let id = store
            .create_alert(trigger_alert("db", "events"), Value::Null, t0())
            .await
            .unwrap();
        store.add_subscription(&id, "ntfy", json!({"topic": "x"})).await.unwrap();

        let deleted = store.delete_alert(&id).await.unwrap().unwrap();
        assert_eq!(
            deleted,
            DeletedAlert {
                alert_kind: AlertKind::Trigger,
                database_name: "db".into(),
                table_name: "events".into(),
            }
        );
        assert!(store.get_alert_detail(&id, t0()).await.unwrap().is_none());
        assert!(store.alert_subscriptions(&id).await.unwrap().is_empty());
        assert_eq!(store.delete_alert(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscription_crud() {
        let (_dir, store) = metadata_store();
        let id = store
            .create_alert(trigger_alert("db", "events"), Value::Null, t0())
            .await
            .unwrap();

        let sub_id = store.add_subscription(&id, "ntfy", json!({"topic": "a"})).await.unwrap();
        store.update_subscription(&sub_id, json!({"topic": "b"})).await.unwrap();

        let subs = store.alert_subscriptions(&id).await.unwrap();
        let sub = subs.iter().find(|s| s.subscription_id == sub_id).unwrap();
        assert_eq!(sub.config, json!({"topic": "b"}));

        store.delete_subscription(&sub_id).await.unwrap();
        assert!(store
            .delete_subscription(&sub_id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .update_subscription(&sub_id, json!({}))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .add_subscription("nope", "ntfy", json!({}))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_claim_due_only_after_deadline_and_once() {
        let (_dir, store) = metadata_store();
        let id = store
            .create_alert(cursor_alert("db", "events"), json!("2024-01-01"), t0())
            .await
            .unwrap();

        // Not yet due
        assert!(store.claim_due_cursor_alerts(t0()).await.unwrap().is_empty());

        let due = t0() + Duration::seconds(61);
        let jobs = store.claim_due_cursor_alerts(due).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0],
            ReadyJob {
                alert_id: id.clone(),
                database_name: "db".into(),
                table_name: "events".into(),
                id_columns: vec!["id".into()],
                timestamp_column: "ts".into(),
                cursor: json!("2024-01-01"),
            }
        );

        // Locked: a second claim sees nothing
        assert!(store.claim_due_cursor_alerts(due).await.unwrap().is_empty());

        let detail = store.get_alert_detail(&id, due).await.unwrap().unwrap();
        assert_eq!(
            detail.current_schedule_started_at.as_deref(),
            Some("2024-01-01 12:01:01")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_exclusive() {
        let (_dir, store) = metadata_store();
        store
            .create_alert(cursor_alert("db", "events"), json!(0), t0())
            .await
            .unwrap();
        let due = t0() + Duration::minutes(5);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_due_cursor_alerts(due).await })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap().unwrap().len();
        }
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_record_tick_unlocks_and_rearms() {
        let (_dir, store) = metadata_store();
        let id = store
            .create_alert(cursor_alert("db", "events"), json!("2024-01-01"), t0())
            .await
            .unwrap();

        let due = t0() + Duration::minutes(2);
        store.claim_due_cursor_alerts(due).await.unwrap();
        store
            .record_tick(&id, vec![json!(1), json!(2)], json!("2024-01-02"), due)
            .await
            .unwrap();

        let detail = store.get_alert_detail(&id, due).await.unwrap().unwrap();
        assert_eq!(detail.current_schedule_started_at, None);
        assert_eq!(detail.next_deadline.as_deref(), Some("2024-01-01 12:03:00"));
        assert_eq!(detail.logs[0].new_ids, vec![json!(1), json!(2)]);
        assert_eq!(detail.logs[0].cursor, json!("2024-01-02"));

        // The new watermark is what the next claim carries
        let next = due + Duration::minutes(1);
        let jobs = store.claim_due_cursor_alerts(next).await.unwrap();
        assert_eq!(jobs[0].cursor, json!("2024-01-02"));
    }

    #[tokio::test]
    async fn test_record_tick_for_unknown_alert_is_not_found() {
        let (_dir, store) = metadata_store();
        let err = store
            .record_tick("missing", vec![], Value::Null, t0())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_reschedule_keeps_watermark() {
        let (_dir, store) = metadata_store();
        let id = store
            .create_alert(cursor_alert("db", "events"), json!(10), t0())
            .await
            .unwrap();

        let due = t0() + Duration::minutes(2);
        store.claim_due_cursor_alerts(due).await.unwrap();
        store.reschedule(&id, due).await.unwrap();

        let detail = store.get_alert_detail(&id, due).await.unwrap().unwrap();
        assert_eq!(detail.current_schedule_started_at, None);
        assert_eq!(detail.logs.len(), 1);
        assert_eq!(detail.logs[0].cursor, json!(10));
    }

    #[tokio::test]
    async fn test_release_stale_locks() {
        let (_dir, store) = metadata_store();
        store
            .create_alert(cursor_alert("db", "events"), json!(0), t0())
            .await
            .unwrap();

        let due = t0() + Duration::minutes(2);
        assert_eq!(store.claim_due_cursor_alerts(due).await.unwrap().len(), 1);

        // Lock is younger than the cutoff: untouched
        assert_eq!(store.release_stale_locks(due - Duration::minutes(1)).await.unwrap(), 0);
        assert!(store.claim_due_cursor_alerts(due).await.unwrap().is_empty());

        assert_eq!(store.release_stale_locks(due + Duration::minutes(1)).await.unwrap(), 1);
        assert_eq!(store.claim_due_cursor_alerts(due).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_alerts_projection() {
        let (_dir, store) = metadata_store();
        let cursor_id = store
            .create_alert(cursor_alert("db", "events"), json!(0), t0())
            .await
            .unwrap();
        let later = t0() + Duration::seconds(5);
        store
            .create_alert(trigger_alert("db", "orders"), Value::Null, later)
            .await
            .unwrap();
        store
            .create_alert(trigger_alert("other", "orders"), Value::Null, later)
            .await
            .unwrap();

        store
            .record_tick(&cursor_id, vec![json!(7)], json!(7), later)
            .await
            .unwrap();

        let list = store.list_alerts("db", later).await.unwrap();
        assert_eq!(list.len(), 2);
        // Newest first
        assert_eq!(list[0].table_name, "orders");
        assert_eq!(list[0].alert_kind, AlertKind::Trigger);
        assert_eq!(list[0].last_notification_at, None);

        let cursor = &list[1];
        assert_eq!(cursor.alert_id, cursor_id);
        assert_eq!(cursor.notifiers, vec!["slack".to_string()]);
        assert_eq!(cursor.last_notification_at.as_deref(), Some("2024-01-01 12:00:05"));
    }
}
