use async_trait::async_trait;
use log::debug;
use serde_json::json;

use super::{post_json, ConfigField, FieldKind, Notifier, NotifyRequest};
use crate::error::RowPulseError;

pub const SLUG: &str = "slack";

/// Posts `{"text": ...}` to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SlackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn slug(&self) -> &str {
        SLUG
    }

    fn name(&self) -> &str {
        "Slack"
    }

    fn description(&self) -> &str {
        "Send alerts to a Slack webhook"
    }

    fn icon(&self) -> &str {
        "bi-slack"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("webhook_url", "Webhook URL", FieldKind::Text)
                .with_description("https://hooks.slack.com/services/..."),
            ConfigField::new("aggregate", "Aggregate mode", FieldKind::Boolean)
                .with_description("Send one message per batch instead of one per row")
                .with_default("true"),
            ConfigField::new("message_template", "Message template", FieldKind::Template),
        ]
    }

    async fn send(&self, request: &NotifyRequest) -> Result<(), RowPulseError> {
        let url = request.require_config_str("webhook_url")?;

        for text in request.messages() {
            post_json(&self.client, url, &json!({ "text": text })).await?;
        }

        debug!(
            "Slack notified for alert {} ({} ids)",
            request.alert_id,
            request.new_ids.len()
        );
        Ok(())
    }
}
