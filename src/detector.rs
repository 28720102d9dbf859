use log::trace;
use rusqlite::Connection;
use serde_json::Value;

use crate::alerts::ReadyJob;
use crate::db::{quote_identifier, validate_table_columns, Database};
use crate::error::RowPulseError;
use crate::utils::Utils;

/// Rows found past the watermark in one tick
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// First identifier column of every new row, in ordering-column order
    pub new_ids: Vec<Value>,
    /// Largest ordering value seen, or the previous cursor if nothing is new
    pub cursor: Value,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.new_ids.is_empty()
    }
}

/// Find rows whose ordering column is strictly greater than the job's cursor.
pub async fn detect(job: &ReadyJob, target: &Database) -> Result<Detection, RowPulseError> {
    let job = job.clone();
    target.interact(move |c| detect_locked(c, &job)).await
}

fn detect_locked(conn: &Connection, job: &ReadyJob) -> Result<Detection, RowPulseError> {
    let id_column = job.id_columns.first().ok_or_else(|| {
        RowPulseError::Validation(format!("Alert {} has no identifier columns", job.alert_id))
    })?;

    validate_table_columns(
        conn,
        &job.table_name,
        &[id_column.as_str(), job.timestamp_column.as_str()],
    )?;

    let id_col = quote_identifier(id_column)?;
    let ts_col = quote_identifier(&job.timestamp_column)?;
    let table = quote_identifier(&job.table_name)?;

    let (condition, params): (String, Vec<rusqlite::types::Value>) = if job.cursor.is_null() {
        (format!("{ts_col} IS NOT NULL"), Vec::new())
    } else {
        (format!("{ts_col} > ?1"), vec![Utils::json_to_sql(&job.cursor)])
    };

    let sql = format!("SELECT {id_col}, {ts_col} FROM {table} WHERE {condition} ORDER BY {ts_col}");
    trace!("Detect for alert {}: {}", job.alert_id, sql);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            Ok((
                Utils::sql_to_json(row.get_ref(0)?),
                Utils::sql_to_json(row.get_ref(1)?),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let cursor = rows
        .last()
        .map(|(_, ts)| ts.clone())
        .unwrap_or_else(|| job.cursor.clone());
    let new_ids = rows.into_iter().map(|(id, _)| id).collect();

    Ok(Detection { new_ids, cursor })
}
