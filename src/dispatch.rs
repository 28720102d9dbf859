use std::time::Duration;

use log::{debug, warn};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use crate::alerts::Subscription;
use crate::db::{quote_identifier, validate_table_columns, Database};
use crate::error::RowPulseError;
use crate::notify::{is_aggregate, NotifierRegistry, NotifyRequest, Row};
use crate::utils::Utils;

/// How delivery failures are handled within one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Attempt every subscription, log and count failures
    BestEffort,
    /// Stop at the first failure and return it
    FailFast,
}

/// The new rows of one tick, as handed to the dispatcher
#[derive(Debug, Clone)]
pub struct Batch {
    pub alert_id: String,
    pub database_name: String,
    pub table_name: String,
    /// Key columns the ids refer to. More than one means every id is an
    /// array with one value per column.
    pub id_columns: Vec<String>,
    /// Single values, or arrays matching `id_columns` for composite keys
    pub new_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Fans a batch out to every subscription of its alert.
#[derive(Clone)]
pub struct Dispatcher {
    registry: NotifierRegistry,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: NotifierRegistry, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub async fn dispatch(
        &self,
        batch: &Batch,
        subscriptions: &[Subscription],
        target: &Database,
        mode: DeliveryMode,
    ) -> Result<DispatchReport, RowPulseError> {
        let mut report = DispatchReport::default();

        let wants_rows = subscriptions
            .iter()
            .any(|s| !is_aggregate(&s.config) && self.registry.contains(&s.notifier));
        let row_data = if wants_rows {
            self.load_rows(batch, target).await
        } else {
            None
        };

        for subscription in subscriptions {
            let Some(notifier) = self.registry.get(&subscription.notifier) else {
                warn!(
                    "Alert {}: no notifier registered as '{}', skipping subscription {}",
                    batch.alert_id, subscription.notifier, subscription.subscription_id
                );
                report.skipped += 1;
                continue;
            };

            let request = NotifyRequest {
                alert_id: batch.alert_id.clone(),
                new_ids: batch.new_ids.clone(),
                config: subscription.config.clone(),
                row_data: if is_aggregate(&subscription.config) {
                    None
                } else {
                    row_data.clone()
                },
                table_name: batch.table_name.clone(),
                database_name: batch.database_name.clone(),
            };

            let result = match tokio::time::timeout(self.send_timeout, notifier.send(&request)).await
            {
                Ok(result) => result,
                Err(_) => Err(RowPulseError::Delivery(format!(
                    "'{}' timed out after {}s",
                    subscription.notifier,
                    self.send_timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(()) => {
                    debug!(
                        "Alert {}: delivered {} id(s) via '{}'",
                        batch.alert_id,
                        batch.new_ids.len(),
                        subscription.notifier
                    );
                    report.delivered += 1;
                }
                Err(e) => match mode {
                    DeliveryMode::FailFast => return Err(e),
                    DeliveryMode::BestEffort => {
                        warn!(
                            "Alert {}: delivery via '{}' failed: {}",
                            batch.alert_id, subscription.notifier, e
                        );
                        report.failed += 1;
                    }
                },
            }
        }

        Ok(report)
    }

    /// Full rows for the batch, read once per tick. Any failure is logged and
    /// treated as "no row data".
    async fn load_rows(&self, batch: &Batch, target: &Database) -> Option<Vec<Row>> {
        if batch.id_columns.is_empty() || batch.new_ids.is_empty() {
            return None;
        }

        let table = batch.table_name.clone();
        let id_columns = batch.id_columns.clone();
        let ids = batch.new_ids.clone();

        match target
            .interact(move |c| fetch_rows(c, &table, &id_columns, &ids))
            .await
        {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!("Alert {}: could not load row data: {}", batch.alert_id, e);
                None
            }
        }
    }
}

fn fetch_rows(
    conn: &Connection,
    table_name: &str,
    id_columns: &[String],
    ids: &[Value],
) -> Result<Vec<Row>, RowPulseError> {
    validate_table_columns(conn, table_name, id_columns)?;

    let table = quote_identifier(table_name)?;
    let columns = id_columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut params = Vec::new();
    let condition = if columns.len() == 1 {
        params.extend(ids.iter().map(Utils::json_to_sql));
        format!("{} IN ({})", columns[0], vec!["?"; ids.len()].join(", "))
    } else {
        let mut terms = Vec::with_capacity(ids.len());
        for id in ids {
            let parts = match id.as_array() {
                Some(parts) if parts.len() == columns.len() => parts,
                _ => {
                    return Err(RowPulseError::Validation(format!(
                        "Identifier {} does not match key columns {:?}",
                        id, id_columns
                    )))
                }
            };
            params.extend(parts.iter().map(Utils::json_to_sql));
            let term = columns
                .iter()
                .map(|c| format!("{} = ?", c))
                .collect::<Vec<_>>()
                .join(" AND ");
            terms.push(format!("({})", term));
        }
        terms.join(" OR ")
    };

    let mut stmt = conn.prepare(&format!("SELECT * FROM {table} WHERE {condition}"))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let rows = stmt
        .query_map(params_from_iter(params), |row| {
            let mut map = Row::new();
            for (i, name) in names.iter().enumerate() {
                map.insert(name.clone(), Utils::sql_to_json(row.get_ref(i)?));
            }
            Ok(map)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}
