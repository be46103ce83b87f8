//! Slack incoming-webhook notifier

use super::{Notifier, TradeEvent};
use async_trait::async_trait;
use std::time::Duration;

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }

    async fn send(&self, text: &str) -> Result<(), reqwest::Error> {
        let payload = serde_json::json!({ "text": text });
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, event: TradeEvent) {
        let text = event.to_string();
        match self.send(&text).await {
            Ok(()) => tracing::debug!("Sent Slack notification"),
            Err(e) => tracing::warn!(error = %e, "Failed to send Slack notification"),
        }
    }
}
