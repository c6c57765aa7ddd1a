//! Out-of-band chat notifications.
//!
//! Fired alerts and critical diagnostics go to a chat channel via a bot
//! token. In dev mode credentials may be absent and the engine runs without a
//! notifier; production refuses to start without one.

use crate::error::{AlertError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

const CHAT_API_URL: &str = "https://slack.com/api/chat.postMessage";

/// Notification sink contract.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, text: &str, channel: &str) -> Result<()>;
    /// Channel fired alerts are routed to.
    fn alert_channel(&self) -> &str;
}

/// Chat notification client
pub struct ChatNotifier {
    client: Client,
    token: String,
    channel: String,
}

#[derive(Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl ChatNotifier {
    /// Build from `SLACK_BOT_TOKEN` / `SLACK_ALERT_CHANNEL`.
    ///
    /// Dev mode tolerates missing credentials and returns `None`; any other
    /// environment treats them as required configuration.
    pub fn from_env(dev_mode: bool) -> Result<Option<Arc<Self>>> {
        let token = std::env::var("SLACK_BOT_TOKEN").ok().filter(|v| !v.is_empty());
        let channel = std::env::var("SLACK_ALERT_CHANNEL")
            .ok()
            .filter(|v| !v.is_empty());

        match (token, channel) {
            (Some(token), Some(channel)) => {
                info!("chat notifications enabled (channel {channel})");
                Ok(Some(Arc::new(Self::new(token, channel))))
            }
            _ if dev_mode => {
                info!("chat notifications disabled (dev mode, credentials absent)");
                Ok(None)
            }
            _ => Err(AlertError::Config(
                "SLACK_BOT_TOKEN and SLACK_ALERT_CHANNEL must be set outside dev".to_string(),
            )),
        }
    }

    pub fn new(token: String, channel: String) -> Self {
        Self {
            client: Client::new(),
            token,
            channel,
        }
    }
}

#[async_trait]
impl Notifier for ChatNotifier {
    async fn send_message(&self, text: &str, channel: &str) -> Result<()> {
        let request = PostMessageRequest { channel, text };

        let response = self
            .client
            .post(CHAT_API_URL)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| AlertError::Notifier(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Notifier(format!(
                "chat API returned HTTP {}",
                response.status()
            )));
        }

        let body: PostMessageResponse = response
            .json()
            .await
            .map_err(|e| AlertError::Notifier(e.to_string()))?;
        if !body.ok {
            return Err(AlertError::Notifier(
                body.error.unwrap_or_else(|| "unknown chat API error".to_string()),
            ));
        }

        debug!("chat notification sent to {channel}");
        Ok(())
    }

    fn alert_channel(&self) -> &str {
        &self.channel
    }
}

/// Escalate a critical condition.
///
/// Production sends a diagnostic to the chat channel with environment,
/// timestamp, calling function and error text; dev mode writes the same
/// content to the local log and stays quiet on the wire.
pub async fn escalate_critical(
    notifier: Option<&Arc<dyn Notifier>>,
    environment: &str,
    function: &str,
    detail: &str,
) {
    let message = format!(
        "🚨 [{}] {} at {}: {}",
        environment,
        function,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        detail
    );

    let is_dev = environment.eq_ignore_ascii_case("dev")
        || environment.eq_ignore_ascii_case("development");
    match notifier {
        Some(notifier) if !is_dev => {
            let channel = notifier.alert_channel().to_string();
            if let Err(e) = notifier.send_message(&message, &channel).await {
                error!("failed to escalate critical condition: {e}; original: {message}");
            }
        }
        _ => error!("{message}"),
    }
}
