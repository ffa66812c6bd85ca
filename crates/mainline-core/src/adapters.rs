use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::WebhookAdapterConfig;
use crate::dlq::DeadLetterQueue;
use crate::types::PipelineEvent;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 signature in the GitHub header format
/// (`sha256=<hex digest>`), shared by outbound signing and the DLQ.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Owns the outbound webhook adapters. Each adapter subscribes to the bus,
/// filters on its configured event types, and POSTs the event with a
/// timeout; a failed delivery is handed to the DLQ for retry.
pub struct AdapterManager {
    bus: Arc<EventBus>,
    dlq: Arc<DeadLetterQueue>,
    adapters: Vec<WebhookAdapterConfig>,
}

impl AdapterManager {
    pub fn new(
        bus: Arc<EventBus>,
        dlq: Arc<DeadLetterQueue>,
        adapters: Vec<WebhookAdapterConfig>,
    ) -> Self {
        Self { bus, dlq, adapters }
    }

    /// Spawn one delivery task per configured adapter.
    pub fn start(&self) {
        for adapter in self.adapters.clone() {
            let mut subscription = self.bus.subscribe();
            let dlq = Arc::clone(&self.dlq);
            info!(url = %adapter.url, "webhook adapter attached");
            tokio::spawn(async move {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_millis(adapter.timeout_ms))
                    .build()
                    .unwrap_or_default();
                while let Some(event) = subscription.rx.recv().await {
                    if !wants(&adapter, &event) {
                        continue;
                    }
                    if let Err(e) = deliver(&client, &adapter, &event).await {
                        warn!(url = %adapter.url, "webhook delivery failed: {e}");
                        let payload = match serde_json::to_value(&event) {
                            Ok(v) => v,
                            Err(se) => {
                                warn!("serialize event for dlq: {se}");
                                continue;
                            }
                        };
                        if let Err(qe) = dlq
                            .enqueue(&adapter.url, adapter.secret.as_deref(), payload, &e.to_string())
                            .await
                        {
                            warn!("dlq enqueue for {}: {qe}", adapter.url);
                        }
                    } else {
                        debug!(url = %adapter.url, "delivered {}", event.event_type);
                    }
                }
            });
        }
    }

    pub fn adapter_count(&self) -> usize {
        self.adapters.len()
    }
}

fn wants(adapter: &WebhookAdapterConfig, event: &PipelineEvent) -> bool {
    match &adapter.events {
        None => true,
        Some(filter) => filter.iter().any(|t| t == event.event_type.as_str()),
    }
}

async fn deliver(
    client: &reqwest::Client,
    adapter: &WebhookAdapterConfig,
    event: &PipelineEvent,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(event)?;
    let mut request = client
        .post(&adapter.url)
        .header("content-type", "application/json")
        .body(body.clone());
    if let Some(secret) = &adapter.secret {
        request = request.header("x-hub-signature-256", sign_payload(secret, &body));
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        anyhow::bail!("remote returned {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // Vector from the GitHub webhook docs.
        let sig = sign_payload("It's a Secret to Everybody", b"Hello, World!");
        assert_eq!(
            sig,
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
    }

    #[test]
    fn adapter_event_filter() {
        use crate::types::{PipelineEvent, PipelineEventType};
        let adapter = WebhookAdapterConfig {
            url: "http://example.invalid/hook".into(),
            secret: None,
            events: Some(vec!["pipeline.completed".into()]),
            timeout_ms: 1_000,
        };
        let completed = PipelineEvent::new(
            PipelineEventType::PipelineCompleted,
            "r1",
            serde_json::json!({}),
        );
        let started = PipelineEvent::new(
            PipelineEventType::PipelineStarted,
            "r1",
            serde_json::json!({}),
        );
        assert!(wants(&adapter, &completed));
        assert!(!wants(&adapter, &started));
    }
}
