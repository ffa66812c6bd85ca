use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::sign_payload;
use crate::config::DlqConfig;

/// One undeliverable outbound webhook, persisted as its own file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub payload: Value,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Dead-letter queue for failed outbound deliveries.
///
/// The sweeper re-delivers due entries with exponential backoff
/// (`base_delay_ms * backoff_factor^attempts`); an entry that exhausts
/// `max_retries` is moved into the `quarantine/` subdirectory and kept for
/// inspection.
pub struct DeadLetterQueue {
    dir: PathBuf,
    max_retries: u32,
    base_delay_ms: u64,
    backoff_factor: f64,
}

impl DeadLetterQueue {
    pub fn new(dir: impl Into<PathBuf>, config: &DlqConfig) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("create dlq dir {}: {e}", dir.display());
        }
        Self {
            dir,
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            backoff_factor: config.backoff_factor,
        }
    }

    /// Persist a failed delivery for later retry.
    pub async fn enqueue(
        &self,
        url: &str,
        secret: Option<&str>,
        payload: Value,
        error: &str,
    ) -> Result<()> {
        let entry = DlqEntry {
            id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            secret: secret.map(str::to_string),
            payload,
            attempts: 1,
            next_retry_at: Utc::now() + self.backoff(1),
            last_error: Some(error.to_string()),
        };
        self.write_entry(&entry).await?;
        info!(url, "dlq: queued delivery {} after failure: {error}", entry.id);
        Ok(())
    }

    /// Deliver every due entry once. Call periodically from the sweeper
    /// task; entries stay untouched until their `next_retry_at` passes.
    pub async fn sweep(&self, client: &reqwest::Client) {
        let entries = match self.load_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("dlq: list entries: {e}");
                return;
            }
        };
        let now = Utc::now();
        for mut entry in entries {
            if entry.next_retry_at > now {
                continue;
            }
            match self.deliver(client, &entry).await {
                Ok(()) => {
                    info!("dlq: delivered {} to {} after {} attempt(s)", entry.id, entry.url, entry.attempts);
                    self.remove_entry(&entry.id).await;
                }
                Err(e) => {
                    entry.attempts += 1;
                    entry.last_error = Some(e.to_string());
                    if entry.attempts > self.max_retries {
                        warn!("dlq: quarantining {} after {} attempts: {e}", entry.id, entry.attempts);
                        self.quarantine(&entry).await;
                    } else {
                        entry.next_retry_at = Utc::now() + self.backoff(entry.attempts);
                        if let Err(we) = self.write_entry(&entry).await {
                            warn!("dlq: rewrite {}: {we}", entry.id);
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, client: &reqwest::Client, entry: &DlqEntry) -> Result<()> {
        let body = serde_json::to_vec(&entry.payload).context("serialize payload")?;
        let mut request = client
            .post(&entry.url)
            .header("content-type", "application/json")
            .body(body.clone());
        if let Some(secret) = &entry.secret {
            request = request.header("x-hub-signature-256", sign_payload(secret, &body));
        }
        let response = request.send().await.context("post")?;
        if !response.status().is_success() {
            anyhow::bail!("remote returned {}", response.status());
        }
        Ok(())
    }

    fn backoff(&self, attempts: u32) -> chrono::Duration {
        let factor = self.backoff_factor.powi(attempts.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * factor) as i64;
        chrono::Duration::milliseconds(ms)
    }

    pub async fn pending_count(&self) -> usize {
        self.load_entries().await.map(|e| e.len()).unwrap_or(0)
    }

    async fn load_entries(&self) -> Result<Vec<DlqEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read {}", self.dir.display()))?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<DlqEntry>(&contents) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!("dlq: corrupt entry {}: {e}", path.display()),
                },
                Err(e) => warn!("dlq: read {}: {e}", path.display()),
            }
        }
        entries.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        Ok(entries)
    }

    async fn write_entry(&self, entry: &DlqEntry) -> Result<()> {
        let path = self.entry_path(&entry.id);
        let json = serde_json::to_string_pretty(entry).context("serialize entry")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    async fn remove_entry(&self, id: &str) {
        let path = self.entry_path(id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("dlq: remove {}: {e}", path.display());
        }
    }

    async fn quarantine(&self, entry: &DlqEntry) {
        let quarantine_dir = self.dir.join("quarantine");
        if let Err(e) = tokio::fs::create_dir_all(&quarantine_dir).await {
            warn!("dlq: create quarantine dir: {e}");
            return;
        }
        // Persist the final attempt count and error alongside the payload.
        if let Ok(json) = serde_json::to_string_pretty(entry) {
            let dest = quarantine_dir.join(format!("{}.json", entry.id));
            if let Err(e) = tokio::fs::write(&dest, json).await {
                warn!("dlq: write quarantined {}: {e}", dest.display());
            }
        }
        self.remove_entry(&entry.id).await;
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}
