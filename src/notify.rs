//! Webhook notifier for entries, exits and operator commands.
//!
//! Delivery is best-effort: failures are logged and never reach the caller.

use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Notifier settings. The webhook URL is read from the named variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    pub enabled: bool,
    pub webhook_url_env: String,
    pub timeout_secs: u64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url_env: "TITAN_WEBHOOK_URL".to_string(),
            timeout_secs: 5,
        }
    }
}

/// Markdown webhook client (DingTalk-style payload).
#[derive(Clone)]
pub struct Notifier {
    http: Client,
    url: Option<String>,
}

impl Notifier {
    /// A notifier that drops every message.
    pub fn disabled() -> Self {
        Self {
            http: Client::new(),
            url: None,
        }
    }

    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn from_settings(settings: &NotifierSettings) -> Self {
        if !settings.enabled {
            return Self::disabled();
        }
        Self::new(
            std::env::var(&settings.webhook_url_env).ok(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Post a titled markdown message.
    pub async fn send(&self, title: &str, body: &str) {
        let Some(url) = &self.url else {
            return;
        };

        let payload = message(title, body);
        match self.http.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => debug!(title = %title, "Notification sent"),
            Ok(resp) => warn!(title = %title, status = %resp.status(), "Notification rejected"),
            Err(e) => warn!(title = %title, error = %e, "Notification failed"),
        }
    }
}

fn message(title: &str, body: &str) -> serde_json::Value {
    let text = format!(
        "### {}\n\n{}\n\n> {}",
        title,
        body,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    serde_json::json!({
        "msgtype": "markdown",
        "markdown": { "title": title, "text": text }
    })
}
