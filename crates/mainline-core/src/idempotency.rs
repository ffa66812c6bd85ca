use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::info;

/// At-most-one in-flight operation per fingerprint, surviving restarts.
///
/// The claim set is persisted to `idempotency.json` inside the same mutex
/// that guards the in-memory set, so concurrent `claim` calls for one
/// fingerprint admit exactly one caller until the matching release.
pub struct IdempotencyGuard {
    path: PathBuf,
    claims: Mutex<BTreeSet<String>>,
}

/// `(op, request_id)` collapsed into the opaque key the guard tracks.
pub fn fingerprint(op: &str, request_id: &str) -> String {
    format!("{op}:{request_id}")
}

impl IdempotencyGuard {
    /// Load persisted claims (missing file = empty set).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let claims: BTreeSet<String> = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        if !claims.is_empty() {
            info!("idempotency guard: {} active claim(s) reloaded", claims.len());
        }
        Ok(Self { path, claims: Mutex::new(claims) })
    }

    /// Returns false when the fingerprint is already held.
    pub async fn claim(&self, fp: &str) -> Result<bool> {
        let mut claims = self.claims.lock().await;
        if claims.contains(fp) {
            return Ok(false);
        }
        claims.insert(fp.to_string());
        self.persist(&claims).await?;
        Ok(true)
    }

    pub async fn release(&self, fp: &str) -> Result<()> {
        let mut claims = self.claims.lock().await;
        if claims.remove(fp) {
            self.persist(&claims).await?;
        }
        Ok(())
    }

    pub async fn is_claimed(&self, fp: &str) -> bool {
        self.claims.lock().await.contains(fp)
    }

    pub async fn active_count(&self) -> usize {
        self.claims.lock().await.len()
    }

    async fn persist(&self, claims: &BTreeSet<String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let json = serde_json::to_string_pretty(claims).context("serialize claims")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}
