use async_trait::async_trait;
use serde_json::{json, Value};

use super::{post_json, ConfigField, FieldKind, Notifier, NotifyRequest};
use crate::error::RowPulseError;
use crate::utils::Utils;

pub const SLUG: &str = "ntfy";
pub const DEFAULT_BASE_URL: &str = "https://ntfy.sh";

/// Publishes to an ntfy server using its JSON publish endpoint.
pub struct NtfyNotifier {
    client: reqwest::Client,
}

impl NtfyNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn payload(request: &NotifyRequest, topic: &str) -> Value {
        let title = format!("{} new items in {}", request.new_ids.len(), request.table_name);
        let message = request
            .new_ids
            .iter()
            .map(|id| format!("- `{}`", Utils::json_to_id_string(id)))
            .collect::<Vec<_>>()
            .join("\n");

        json!({
            "topic": topic,
            "title": title,
            "message": message,
            "markdown": true,
        })
    }
}

impl Default for NtfyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    fn slug(&self) -> &str {
        SLUG
    }

    fn name(&self) -> &str {
        "Ntfy"
    }

    fn description(&self) -> &str {
        "Send alerts to ntfy.sh"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("base_url", "Base URL", FieldKind::Text).with_default(DEFAULT_BASE_URL),
            ConfigField::new("topic", "Topic", FieldKind::Text),
        ]
    }

    async fn send(&self, request: &NotifyRequest) -> Result<(), RowPulseError> {
        let base_url = request.config_str("base_url").unwrap_or(DEFAULT_BASE_URL);
        let topic = request.require_config_str("topic")?;

        post_json(&self.client, base_url, &Self::payload(request, topic)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_payload_lists_ids() {
        let request = NotifyRequest {
            alert_id: "a1".into(),
            new_ids: vec![json!(7), json!("x9")],
            config: json!({"topic": "alerts"}),
            row_data: None,
            table_name: "orders".into(),
            database_name: "shop".into(),
        };

        assert_eq!(
            NtfyNotifier::payload(&request, "alerts"),
            json!({
                "topic": "alerts",
                "title": "2 new items in orders",
                "message": "- `7`\n- `x9`",
                "markdown": true,
            })
        );
    }
}
