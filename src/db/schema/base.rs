pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '2');

-- One row per watch configuration. Timestamps are UTC 'YYYY-MM-DD HH:MM:SS'.
CREATE TABLE IF NOT EXISTS alerts (
    alert_id TEXT PRIMARY KEY,
    alert_creator_id TEXT NOT NULL,
    alert_created_at TEXT NOT NULL,
    database_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    id_columns TEXT NOT NULL DEFAULT '[]',     -- JSON array of identifier column names

    -- cursor alerts
    timestamp_column TEXT,
    frequency TEXT,                            -- recurrence expression, e.g. '+5 minutes'
    next_deadline TEXT,
    current_schedule_started_at TEXT,          -- non-NULL while a worker owns the tick

    alert_kind TEXT NOT NULL DEFAULT 'cursor', -- 'cursor' | 'trigger'

    -- trigger alerts
    filter_params TEXT                         -- JSON filter predicate, NULL for none
);

CREATE INDEX IF NOT EXISTS idx_alerts_database ON alerts (database_name);
CREATE INDEX IF NOT EXISTS idx_alerts_kind_deadline ON alerts (alert_kind, next_deadline);

CREATE TABLE IF NOT EXISTS alert_subscriptions (
    subscription_id TEXT PRIMARY KEY,
    alert_id TEXT NOT NULL,
    notifier TEXT NOT NULL,                    -- notifier slug
    config TEXT NOT NULL DEFAULT '{}',         -- JSON object, channel specific
    FOREIGN KEY (alert_id) REFERENCES alerts(alert_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_alert ON alert_subscriptions (alert_id);

-- Append-only record of every detection tick. The newest row per alert
-- carries the durable cursor.
CREATE TABLE IF NOT EXISTS alert_logs (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id TEXT NOT NULL,
    logged_at TEXT NOT NULL,
    new_ids TEXT NOT NULL DEFAULT '[]',        -- JSON array
    cursor,                                    -- untyped: keeps text/integer/real as written
    FOREIGN KEY (alert_id) REFERENCES alerts(alert_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_alert_logs_alert ON alert_logs (alert_id, log_id);

COMMIT;
"#;

/// The first released schema, kept to exercise the upgrade path.
#[cfg(test)]
pub const V1_SCHEMA_SQL: &str = r#"
CREATE TABLE meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT INTO meta (key, value) VALUES ('schema_version', '1');

CREATE TABLE alerts (
    alert_id TEXT PRIMARY KEY,
    alert_creator_id TEXT NOT NULL,
    alert_created_at TEXT NOT NULL,
    database_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    id_columns TEXT NOT NULL DEFAULT '[]',
    timestamp_column TEXT,
    frequency TEXT,
    next_deadline TEXT,
    current_schedule_started_at TEXT
);

CREATE TABLE alert_subscriptions (
    subscription_id TEXT PRIMARY KEY,
    alert_id TEXT NOT NULL,
    notifier TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (alert_id) REFERENCES alerts(alert_id) ON DELETE CASCADE
);

CREATE TABLE alert_logs (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_id TEXT NOT NULL,
    logged_at TEXT NOT NULL,
    new_ids TEXT NOT NULL DEFAULT '[]',
    cursor,
    FOREIGN KEY (alert_id) REFERENCES alerts(alert_id) ON DELETE CASCADE
);
"#;
