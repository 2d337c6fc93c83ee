//! Outbound webhook delivery. Each configured `WebhookConfig` becomes one
//! [`WebhookAdapter`], registered with the [`DeadLetterQueue`] for retry and
//! also wired as a direct [`EventHandler`] for the fast path — grounded on
//! `factory/github.rs`'s bearer-auth `reqwest::Client` usage, generalized
//! from a single GitHub endpoint to an arbitrary configured URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use branchline_common::Event;

use crate::config::WebhookConfig;
use crate::events::EventHandler;
use crate::resilience::dlq::{DeadLetterQueue, OutboundAdapter};

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub struct WebhookAdapter {
    name: String,
    url: String,
    secret: Option<String>,
    events: Option<Vec<String>>,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let timeout_ms = config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let client = reqwest::Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        Ok(Self {
            name: format!("webhook:{}", config.url),
            url: config.url.clone(),
            secret: config.secret.clone(),
            events: config.events.clone(),
            client,
        })
    }

    /// §6's per-webhook filter list: when set, only listed event types are
    /// delivered to this adapter.
    fn accepts(&self, event: &Event) -> bool {
        match &self.events {
            Some(allowed) => allowed.iter().any(|k| k == event.event_type.as_str()),
            None => true,
        }
    }

    async fn post(&self, event: &Event) -> anyhow::Result<()> {
        let mut request = self.client.post(&self.url).json(event);
        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Secret", secret);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook {} responded with {}", self.url, response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl OutboundAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        self.post(event).await
    }
}

/// The fast-path handler registered on the bus with `on_all`: deliver
/// immediately, and on failure hand the event to the DLQ for retry. Non-2xx
/// responses and connection failures alike are swallowed here per §7's
/// propagation policy — the bus must never see an `Err` from this handler.
pub struct DirectDeliveryHandler {
    adapter: Arc<WebhookAdapter>,
    dlq: Arc<DeadLetterQueue>,
}

impl DirectDeliveryHandler {
    pub fn new(adapter: Arc<WebhookAdapter>, dlq: Arc<DeadLetterQueue>) -> Self {
        Self { adapter, dlq }
    }
}

#[async_trait]
impl EventHandler for DirectDeliveryHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if !self.adapter.accepts(event) {
            return Ok(());
        }
        if let Err(e) = self.adapter.post(event).await {
            if let Err(enqueue_err) = self.dlq.enqueue(self.adapter.name(), event.clone(), &e).await {
                tracing::error!(
                    adapter = self.adapter.name(),
                    error = %enqueue_err,
                    "failed to enqueue webhook delivery to DLQ"
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.adapter.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> WebhookConfig {
        WebhookConfig { url: url.to_string(), secret: None, events: None, timeout_ms: None }
    }

    #[test]
    fn adapter_name_includes_url() {
        let adapter = WebhookAdapter::new(&config("https://example.com/hook")).unwrap();
        assert_eq!(adapter.name(), "webhook:https://example.com/hook");
    }

    #[test]
    fn filter_restricts_to_listed_event_types() {
        let mut cfg = config("https://example.com/hook");
        cfg.events = Some(vec!["pipeline.completed".to_string()]);
        let adapter = WebhookAdapter::new(&cfg).unwrap();

        let matching = Event::new(branchline_common::EventKind::PipelineCompleted, "r1", serde_json::json!({}));
        let other = Event::new(branchline_common::EventKind::PipelineFailed, "r1", serde_json::json!({}));
        assert!(adapter.accepts(&matching));
        assert!(!adapter.accepts(&other));
    }

    #[test]
    fn no_filter_accepts_everything() {
        let adapter = WebhookAdapter::new(&config("https://example.com/hook")).unwrap();
        let event = Event::new(branchline_common::EventKind::CleanupCompleted, "r1", serde_json::json!({}));
        assert!(adapter.accepts(&event));
    }
}
