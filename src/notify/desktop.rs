use async_trait::async_trait;
use tokio::process::Command;

use super::{ConfigField, FieldKind, Notifier, NotifyRequest};
use crate::error::RowPulseError;

pub const SLUG: &str = "desktop";
pub const DEFAULT_TITLE: &str = "rowpulse alert";

/// Shows a notification on the machine running the engine, through
/// `notify-send` on Linux/BSD and `osascript` on macOS.
pub struct DesktopNotifier;

impl DesktopNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Quote a string as an AppleScript string literal
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn applescript_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(target_os = "macos")]
fn notification_command(title: &str, message: &str) -> Result<Command, RowPulseError> {
    let script = format!(
        "display notification {} with title {}",
        applescript_string(message),
        applescript_string(title)
    );
    let mut cmd = Command::new("osascript");
    cmd.arg("-e").arg(script);
    Ok(cmd)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn notification_command(title: &str, message: &str) -> Result<Command, RowPulseError> {
    let mut cmd = Command::new("notify-send");
    cmd.arg("--").arg(title).arg(message);
    Ok(cmd)
}

#[cfg(not(unix))]
fn notification_command(_title: &str, _message: &str) -> Result<Command, RowPulseError> {
    Err(RowPulseError::Delivery(
        "Desktop notifications are not supported on this platform".into(),
    ))
}

async fn show(title: &str, message: &str) -> Result<(), RowPulseError> {
    let output = notification_command(title, message)?
        .output()
        .await
        .map_err(|e| RowPulseError::Delivery(format!("Could not run notifier command: {}", e)))?;

    if !output.status.success() {
        return Err(RowPulseError::Delivery(format!(
            "Notifier command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl Notifier for DesktopNotifier {
    fn slug(&self) -> &str {
        SLUG
    }

    fn name(&self) -> &str {
        "Desktop"
    }

    fn description(&self) -> &str {
        "Send alerts to your Desktop"
    }

    fn icon(&self) -> &str {
        "bi-terminal"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::new("title", "Title", FieldKind::Text).with_default(DEFAULT_TITLE),
            ConfigField::new("aggregate", "Aggregate mode", FieldKind::Boolean)
                .with_description("Send one notification per batch instead of one per row")
                .with_default("true"),
            ConfigField::new("message_template", "Message template", FieldKind::Template),
        ]
    }

    async fn send(&self, request: &NotifyRequest) -> Result<(), RowPulseError> {
        let title = request.config_str("title").unwrap_or(DEFAULT_TITLE);
        for message in request.messages() {
            show(title, &message).await?;
        }
        Ok(())
    }
}
