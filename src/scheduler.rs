use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::alerts::{AlertStore, ReadyJob, TriggerAlert};
use crate::config::SchedulerConfig;
use crate::detector;
use crate::dispatch::{Batch, DeliveryMode, Dispatcher};
use crate::error::RowPulseError;
use crate::queue::{self, QueueItem, QueueManager};
use crate::sources::DataSources;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub lock_timeout: Duration,
    pub claim_limit: u32,
    pub lease_secs: i64,
    pub retry_delay_secs: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(900),
            claim_limit: queue::DEFAULT_CLAIM_LIMIT,
            lease_secs: queue::DEFAULT_LEASE_SECS,
            retry_delay_secs: queue::DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            lock_timeout: config.lock_timeout(),
            claim_limit: config.claim_limit,
            lease_secs: config.lease_secs,
            retry_delay_secs: config.retry_delay_secs,
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub stale_locks_released: usize,
    pub cursor_ticks: usize,
    /// Cursor alerts rescheduled without a tick because detection failed
    pub cursor_errors: usize,
    pub trigger_batches: usize,
    pub items_completed: usize,
    pub items_failed: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
}

impl PassReport {
    pub fn is_idle(&self) -> bool {
        *self == PassReport::default()
    }
}

/// An alert deleted while its tick was in flight is not an error
fn tolerate_deleted(result: Result<(), RowPulseError>, alert_id: &str) -> Result<bool, RowPulseError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!("Alert {} was deleted during its tick", alert_id);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub struct Scheduler {
    store: AlertStore,
    sources: DataSources,
    dispatcher: Dispatcher,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(
        store: AlertStore,
        sources: DataSources,
        dispatcher: Dispatcher,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            sources,
            dispatcher,
            settings,
        }
    }

    /// Poll until `shutdown` fires. A metadata store error ends the loop and
    /// is returned; errors confined to one alert are logged and skipped.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), RowPulseError> {
        info!(
            "Scheduler started (polling every {} ms)",
            self.settings.poll_interval.as_millis()
        );

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_pass(Utc::now()).await {
                        Ok(report) if !report.is_idle() => debug!("Scheduler pass: {:?}", report),
                        Ok(_) => {}
                        Err(e) => {
                            error!("Scheduler stopping on metadata store error: {}", e);
                            return Err(e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// One pass over due cursor alerts and every trigger alert queue.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, RowPulseError> {
        let _tmr = timer!(Level::Trace; "Scheduler::run_pass");
        let mut report = PassReport::default();

        let lock_timeout = chrono::Duration::from_std(self.settings.lock_timeout)
            .map_err(|e| RowPulseError::Error(format!("Invalid lock timeout: {}", e)))?;
        report.stale_locks_released = self.store.release_stale_locks(now - lock_timeout).await?;

        for job in self.store.claim_due_cursor_alerts(now).await? {
            self.cursor_tick(&job, now, &mut report).await?;
        }

        for alert in self.store.list_trigger_alerts().await? {
            self.trigger_tick(&alert, now, &mut report).await?;
        }

        Ok(report)
    }

    async fn cursor_tick(
        &self,
        job: &ReadyJob,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), RowPulseError> {
        let detected = match self.sources.get(&job.database_name) {
            Ok(target) => detector::detect(job, target).await.map(|d| (d, target)),
            Err(e) => Err(e),
        };

        let (detection, target) = match detected {
            Ok(found) => found,
            Err(e) => {
                warn!("Alert {}: detection failed: {}", job.alert_id, e);
                report.cursor_errors += 1;
                // Release the lock, keep the watermark
                tolerate_deleted(self.store.reschedule(&job.alert_id, now).await, &job.alert_id)?;
                return Ok(());
            }
        };

        let recorded = tolerate_deleted(
            self.store
                .record_tick(&job.alert_id, detection.new_ids.clone(), detection.cursor.clone(), now)
                .await,
            &job.alert_id,
        )?;
        report.cursor_ticks += 1;

        if !recorded || detection.is_empty() {
            return Ok(());
        }

        info!(
            "Alert {}: {} new row(s) in {}.{}",
            job.alert_id,
            detection.new_ids.len(),
            job.database_name,
            job.table_name
        );

        let subscriptions = self.store.alert_subscriptions(&job.alert_id).await?;
        let batch = Batch {
            alert_id: job.alert_id.clone(),
            database_name: job.database_name.clone(),
            table_name: job.table_name.clone(),
            // Detection reports the first identifier column only
            id_columns: job.id_columns.iter().take(1).cloned().collect(),
            new_ids: detection.new_ids,
        };

        match self
            .dispatcher
            .dispatch(&batch, &subscriptions, target, DeliveryMode::BestEffort)
            .await
        {
            Ok(dispatched) => {
                report.delivered += dispatched.delivered;
                report.delivery_failures += dispatched.failed;
            }
            Err(e) => {
                warn!("Alert {}: dispatch failed: {}", job.alert_id, e);
                report.delivery_failures += 1;
            }
        }

        Ok(())
    }

    async fn trigger_tick(
        &self,
        alert: &TriggerAlert,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), RowPulseError> {
        let target = match self.sources.get(&alert.database_name) {
            Ok(db) => db,
            Err(e) => {
                warn!("Alert {}: {}", alert.alert_id, e);
                return Ok(());
            }
        };

        let queue = QueueManager::new(target.clone());
        let worker_id = Uuid::new_v4().to_string();

        let items = match queue
            .claim(
                &alert.alert_id,
                &worker_id,
                self.settings.claim_limit,
                self.settings.lease_secs,
                now,
            )
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!("Alert {}: could not claim queue items: {}", alert.alert_id, e);
                return Ok(());
            }
        };

        if items.is_empty() {
            return Ok(());
        }
        report.trigger_batches += 1;

        let new_ids: Vec<Value> = items
            .iter()
            .map(|item| item_identifier(item, alert.id_columns.len()))
            .collect();

        let subscriptions = self.store.alert_subscriptions(&alert.alert_id).await?;
        let batch = Batch {
            alert_id: alert.alert_id.clone(),
            database_name: alert.database_name.clone(),
            table_name: alert.table_name.clone(),
            id_columns: alert.id_columns.clone(),
            new_ids,
        };

        match self
            .dispatcher
            .dispatch(&batch, &subscriptions, target, DeliveryMode::FailFast)
            .await
        {
            Ok(dispatched) => {
                report.delivered += dispatched.delivered;
                let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
                match queue.complete(&alert.alert_id, &ids, &worker_id, now).await {
                    Ok(completed) => report.items_completed += completed,
                    Err(e) => warn!("Alert {}: could not complete items: {}", alert.alert_id, e),
                }

                tolerate_deleted(
                    self.store
                        .record_tick(&alert.alert_id, batch.new_ids, Value::Null, now)
                        .await,
                    &alert.alert_id,
                )?;
            }
            Err(e) => {
                warn!(
                    "Alert {}: delivery failed, {} item(s) will be retried: {}",
                    alert.alert_id,
                    items.len(),
                    e
                );
                report.delivery_failures += 1;

                let message = e.to_string();
                for item in &items {
                    match queue
                        .fail(
                            &alert.alert_id,
                            item.id,
                            &worker_id,
                            &message,
                            self.settings.retry_delay_secs,
                            now,
                        )
                        .await
                    {
                        Ok(true) => report.items_failed += 1,
                        Ok(false) => {}
                        Err(e) => warn!("Alert {}: could not fail item {}: {}", alert.alert_id, item.id, e),
                    }
                }
            }
        }

        Ok(())
    }
}

/// Composite keys are queued as JSON array text
fn item_identifier(item: &QueueItem, key_columns: usize) -> Value {
    if key_columns > 1 {
        if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(&item.item_id) {
            return parsed;
        }
    }
    Value::String(item.item_id.clone())
}
