/// Schema Upgrade: Version 1 → 2
///
/// Adds trigger-based alerts alongside the original cursor-polling alerts:
///   - `alert_kind` selects which field group of the row is meaningful.
///     Every pre-existing alert is a cursor alert.
///   - `filter_params` holds the JSON filter predicate for trigger alerts.
pub const UPGRADE_1_TO_2_SQL: &str = r#"
-- Verify schema version is exactly 1
SELECT 1 / (CASE WHEN (SELECT value FROM meta WHERE key = 'schema_version') = '1' THEN 1 ELSE 0 END);

ALTER TABLE alerts ADD COLUMN alert_kind TEXT NOT NULL DEFAULT 'cursor';
ALTER TABLE alerts ADD COLUMN filter_params TEXT;

CREATE INDEX IF NOT EXISTS idx_alerts_kind_deadline ON alerts (alert_kind, next_deadline);
"#;
