use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::config::NotifierConfig;

/// One-shot operator notifications. Strictly best-effort: failures are
/// logged and swallowed, never surfaced to a call.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str);
}

/// Posts to a chat relay endpoint (bot token baked into the URL).
pub struct ChatRelay {
    client: reqwest::Client,
    relay_url: String,
    chat_id: String,
}

#[async_trait]
impl Notifier for ChatRelay {
    async fn send(&self, text: &str) {
        let payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_notification": false,
        });
        let result = self
            .client
            .post(&self.relay_url)
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Notified operator channel");
            }
            Ok(response) => {
                tracing::warn!("Notifier rejected: {}", response.status());
            }
            Err(err) => {
                tracing::warn!("Notifier unreachable: {}", err);
            }
        }
    }
}

pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, text: &str) {
        tracing::debug!("Notification (no sink): {}", text);
    }
}

pub fn from_config(config: &NotifierConfig) -> Arc<dyn Notifier> {
    if config.enabled && !config.relay_url.is_empty() {
        Arc::new(ChatRelay {
            client: reqwest::Client::new(),
            relay_url: config.relay_url.clone(),
            chat_id: config.chat_id.clone(),
        })
    } else {
        Arc::new(NullNotifier)
    }
}
