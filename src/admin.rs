use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::alerts::{AlertDetail, AlertKind, AlertStore, AlertSummary, NewAlert};
use crate::db::{quote_identifier, validate_table_columns};
use crate::error::RowPulseError;
use crate::notify::{NotifierDescriptor, NotifierRegistry};
use crate::queue::{QueueManager, QueueStats};
use crate::sources::DataSources;
use crate::utils::Utils;

/// Alert detail plus the state of its queue (trigger alerts only)
#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    #[serde(flatten)]
    pub detail: AlertDetail,
    pub queue: Option<QueueStats>,
}

/// Management operations that touch both the metadata store and the
/// target databases.
#[derive(Clone)]
pub struct AlertAdmin {
    store: AlertStore,
    sources: DataSources,
    registry: NotifierRegistry,
    max_attempts: u32,
}

impl AlertAdmin {
    pub fn new(
        store: AlertStore,
        sources: DataSources,
        registry: NotifierRegistry,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            sources,
            registry,
            max_attempts,
        }
    }

    /// Validate the request against the target schema, create the alert
    /// and, for trigger alerts, install the queue and trigger. A cursor
    /// alert starts from the current maximum of its ordering column so
    /// existing rows are not reported.
    pub async fn create_alert(
        &self,
        request: NewAlert,
        now: DateTime<Utc>,
    ) -> Result<String, RowPulseError> {
        request.validate()?;
        for sub in &request.subscriptions {
            self.check_notifier(&sub.notifier_slug)?;
        }

        let target = self.sources.get(&request.database_name)?.clone();

        let table = request.table_name.clone();
        let columns: Vec<String> = request
            .referenced_columns()
            .into_iter()
            .map(String::from)
            .collect();
        let timestamp_column = request.timestamp_column.clone();

        let seed_cursor = target
            .interact(move |c| {
                validate_table_columns(c, &table, &columns)?;
                match timestamp_column {
                    Some(ts) => {
                        let sql = format!(
                            "SELECT max({}) FROM {}",
                            quote_identifier(&ts)?,
                            quote_identifier(&table)?
                        );
                        Ok(c.query_row(&sql, [], |row| Ok(Utils::sql_to_json(row.get_ref(0)?)))?)
                    }
                    None => Ok(Value::Null),
                }
            })
            .await?;

        let alert_id = self
            .store
            .create_alert(request.clone(), seed_cursor, now)
            .await?;

        if request.alert_kind == AlertKind::Trigger {
            let provisioned = QueueManager::new(target)
                .provision(
                    &alert_id,
                    &request.table_name,
                    &request.id_columns,
                    &request.filter,
                    self.max_attempts,
                )
                .await;

            if let Err(e) = provisioned {
                warn!("Provisioning failed for alert {}, removing it: {}", alert_id, e);
                if let Err(delete_err) = self.store.delete_alert(&alert_id).await {
                    error!("Could not remove alert {}: {}", alert_id, delete_err);
                }
                return Err(e);
            }
        }

        Ok(alert_id)
    }

    /// Delete an alert and, for trigger alerts, drop its queue and trigger.
    pub async fn delete_alert(&self, alert_id: &str) -> Result<(), RowPulseError> {
        let deleted = self
            .store
            .delete_alert(alert_id)
            .await?
            .ok_or_else(|| RowPulseError::NotFound(format!("Alert '{}' not found", alert_id)))?;

        if deleted.alert_kind == AlertKind::Trigger {
            let teardown = match self.sources.get(&deleted.database_name) {
                Ok(target) => QueueManager::new(target.clone()).teardown(alert_id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = teardown {
                warn!(
                    "Alert {} deleted but its queue in '{}' was not removed: {}",
                    alert_id, deleted.database_name, e
                );
            }
        }

        info!("Alert {} removed", alert_id);
        Ok(())
    }

    pub async fn list_alerts(
        &self,
        database_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertSummary>, RowPulseError> {
        self.store.list_alerts(database_name, now).await
    }

    pub async fn alert_detail(
        &self,
        alert_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AlertView, RowPulseError> {
        let detail = self
            .store
            .get_alert_detail(alert_id, now)
            .await?
            .ok_or_else(|| RowPulseError::NotFound(format!("Alert '{}' not found", alert_id)))?;

        let queue = if detail.alert_kind == AlertKind::Trigger {
            match self.sources.get(&detail.database_name) {
                Ok(target) => QueueManager::new(target.clone())
                    .stats(alert_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Could not read queue stats for alert {}: {}", alert_id, e);
                        None
                    }),
                Err(_) => None,
            }
        } else {
            None
        };

        Ok(AlertView { detail, queue })
    }

    pub async fn add_subscription(
        &self,
        alert_id: &str,
        notifier_slug: &str,
        config: Value,
    ) -> Result<String, RowPulseError> {
        self.check_notifier(notifier_slug)?;
        self.store
            .add_subscription(alert_id, notifier_slug, config)
            .await
    }

    pub async fn update_subscription(
        &self,
        subscription_id: &str,
        config: Value,
    ) -> Result<(), RowPulseError> {
        self.store.update_subscription(subscription_id, config).await
    }

    pub async fn delete_subscription(&self, subscription_id: &str) -> Result<(), RowPulseError> {
        self.store.delete_subscription(subscription_id).await
    }

    pub fn notifiers(&self) -> Vec<NotifierDescriptor> {
        self.registry.descriptors()
    }

    fn check_notifier(&self, slug: &str) -> Result<(), RowPulseError> {
        if self.registry.contains(slug) {
            Ok(())
        } else {
            Err(RowPulseError::Validation(format!("Unknown notifier '{}'", slug)))
        }
    }
}
