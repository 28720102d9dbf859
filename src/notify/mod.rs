pub mod desktop;
pub mod ntfy;
pub mod slack;
pub mod template;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::RowPulseError;
use crate::utils::Utils;
use template::resolve_template;

/// A full row of the watched table, column name to value
pub type Row = Map<String, Value>;

const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Boolean,
    /// Rich message template with variable placeholders
    Template,
}

/// One entry of a notifier's configuration form
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigField {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
    pub default: Option<&'static str>,
}

impl ConfigField {
    pub fn new(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            kind,
            description: "",
            default: None,
        }
    }

    pub fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn with_default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }
}

/// Everything a channel receives for one delivery
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyRequest {
    pub alert_id: String,
    pub new_ids: Vec<Value>,
    /// The subscription's configuration object
    pub config: Value,
    /// Present only for non-aggregate subscriptions whose rows could be read
    pub row_data: Option<Vec<Row>>,
    pub table_name: String,
    pub database_name: String,
}

impl NotifyRequest {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn require_config_str(&self, key: &str) -> Result<&str, RowPulseError> {
        self.config_str(key).ok_or_else(|| {
            RowPulseError::Delivery(format!("Subscription config is missing '{}'", key))
        })
    }

    /// Whether the subscription wants one message per batch. Defaults to true.
    pub fn aggregate(&self) -> bool {
        is_aggregate(&self.config)
    }

    /// Message bodies to deliver: one per batch in aggregate mode (or when
    /// no row data is available), otherwise one per row. Without a template
    /// the single message is "<n> new items".
    pub fn messages(&self) -> Vec<String> {
        let template = match self.config.get("message_template") {
            Some(doc) if doc.is_object() => doc,
            _ => return vec![format!("{} new items", self.new_ids.len())],
        };

        match &self.row_data {
            Some(rows) if !self.aggregate() && !rows.is_empty() => rows
                .iter()
                .map(|row| {
                    let vars: HashMap<String, String> = row
                        .iter()
                        .map(|(k, v)| (k.clone(), Utils::json_to_id_string(v)))
                        .collect();
                    resolve_template(template, &vars)
                })
                .collect(),
            _ => {
                let vars = HashMap::from([
                    ("count".to_string(), self.new_ids.len().to_string()),
                    ("table_name".to_string(), self.table_name.clone()),
                ]);
                vec![resolve_template(template, &vars)]
            }
        }
    }
}

pub fn is_aggregate(config: &Value) -> bool {
    config
        .get("aggregate")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

/// A delivery channel. Implementations are registered by slug in a
/// [`NotifierRegistry`] and looked up for each subscription.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Unique short identifier stored on subscriptions
    fn slug(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn icon(&self) -> &str {
        ""
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        Vec::new()
    }

    /// Deliver one notification. Failures are reported as
    /// [`RowPulseError::Delivery`].
    async fn send(&self, request: &NotifyRequest) -> Result<(), RowPulseError>;
}

/// What a UI needs to render a notifier picker
#[derive(Debug, Clone, Serialize)]
pub struct NotifierDescriptor {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub config_fields: Vec<ConfigField>,
}

#[derive(Clone, Default)]
pub struct NotifierRegistry {
    notifiers: BTreeMap<String, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in channels named in `enabled`. Unknown
    /// names are skipped with a warning.
    pub fn with_builtins<S: AsRef<str>>(enabled: &[S]) -> Self {
        let mut registry = Self::new();
        for slug in enabled {
            match slug.as_ref() {
                slack::SLUG => registry.register(Arc::new(slack::SlackNotifier::new())),
                ntfy::SLUG => registry.register(Arc::new(ntfy::NtfyNotifier::new())),
                desktop::SLUG => registry.register(Arc::new(desktop::DesktopNotifier::new())),
                other => warn!("Unknown built-in notifier '{}' ignored", other),
            }
        }
        registry
    }

    /// Register a channel, replacing any previous one with the same slug.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.slug().to_string(), notifier);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn Notifier>> {
        self.notifiers.get(slug).cloned()
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.notifiers.contains_key(slug)
    }

    /// Sorted slugs of every registered channel
    pub fn slugs(&self) -> Vec<&str> {
        self.notifiers.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> Vec<NotifierDescriptor> {
        self.notifiers
            .values()
            .map(|n| NotifierDescriptor {
                slug: n.slug().to_string(),
                name: n.name().to_string(),
                description: n.description().to_string(),
                icon: n.icon().to_string(),
                config_fields: n.config_fields(),
            })
            .collect()
    }
}

/// POST a JSON body, treating transport errors and non-2xx statuses as
/// delivery failures.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
) -> Result<(), RowPulseError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| RowPulseError::Delivery(format!("POST {} failed: {}", url, e)))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let text = response.text().await.unwrap_or_default();
    let text: String = text.chars().take(MAX_ERROR_BODY).collect();
    Err(RowPulseError::Delivery(format!("HTTP {}: {}", status, text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request(config: Value, row_data: Option<Vec<Row>>) -> NotifyRequest {
        NotifyRequest {
            alert_id: "a1".into(),
            new_ids: vec![json!(1), json!(2)],
            config,
            row_data,
            table_name: "orders".into(),
            database_name: "shop".into(),
        }
    }

    fn template(vars: &[&str]) -> Value {
        let content: Vec<Value> = vars
            .iter()
            .map(|v| json!({"type": "templateVariable", "attrs": {"varName": v}}))
            .collect();
        json!({"type": "doc", "content": [{"type": "paragraph", "content": content}]})
    }

    fn row(id: i64, status: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("status".into(), json!(status));
        row
    }

    #[test]
    fn test_messages_without_template() {
        assert_eq!(request(json!({}), None).messages(), vec!["2 new items"]);
    }

    #[test]
    fn test_messages_aggregate_template() {
        let req = request(json!({"message_template": template(&["count", "table_name"])}), None);
        assert_eq!(req.messages(), vec!["2orders"]);
    }

    #[test]
    fn test_messages_per_row() {
        let config = json!({"aggregate": false, "message_template": template(&["id", "status"])});
        let req = request(config.clone(), Some(vec![row(1, "new"), row(2, "paid")]));
        assert_eq!(req.messages(), vec!["1new", "2paid"]);

        // No row data falls back to one aggregate message
        let req = request(config, None);
        assert_eq!(req.messages(), vec!["{{id}}{{status}}"]);
    }

    #[test]
    fn test_registry_builtins_and_descriptors() {
        let registry = NotifierRegistry::with_builtins(&["slack", "ntfy", "pager"]);
        assert_eq!(registry.slugs(), vec!["ntfy", "slack"]);
        assert!(registry.get("slack").is_some());
        assert!(registry.get("desktop").is_none());

        let descriptors = registry.descriptors();
        assert_eq!(descriptors[1].name, "Slack");
        assert!(descriptors[1]
            .config_fields
            .iter()
            .any(|f| f.name == "webhook_url"));
    }

    #[test]
    fn test_require_config_str() {
        let req = request(json!({"topic": "  "}), None);
        assert!(matches!(
            req.require_config_str("topic"),
            Err(RowPulseError::Delivery(_))
        ));
        assert!(req.aggregate());
    }
}
