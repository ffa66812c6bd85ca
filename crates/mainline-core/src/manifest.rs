use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::types::{
    Manifest, ManifestPendingMergeEntry, ManifestReadyEntry, MergeHistoryEntry,
};

/// PR details recorded when a ready entry moves to pending_merge.
#[derive(Debug, Clone)]
pub struct PrInfo {
    pub integration_branch: String,
    pub pr_number: u64,
    pub pr_url: String,
    pub conflicts_resolved: u32,
    pub base_main_sha: String,
}

/// Owner of `.pipeline/manifest.json`.
///
/// All mutation goes through a per-project lock and an atomic
/// write-to-temp-then-rename, so a crash never leaves a torn document.
/// Container invariants are checked on every mutation; a violation is
/// logged and the mutation refused, leaving the prior state intact.
pub struct ManifestManager {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestManager {
    pub fn new(pipeline_dir: impl Into<PathBuf>) -> Self {
        let dir = pipeline_dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("create pipeline dir {}: {e}", dir.display());
        }
        Self { path: dir.join("manifest.json"), lock: Mutex::new(()) }
    }

    pub async fn add_to_ready(&self, entry: ManifestReadyEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        if let Some(stage) = manifest.container_of(&entry.branch) {
            error!("manifest: branch {} already in {stage:?}, refusing add_to_ready", entry.branch);
            bail!("branch {} already tracked in {stage:?}", entry.branch);
        }
        info!("manifest: {} -> ready (priority {})", entry.branch, entry.priority);
        manifest.ready.push(entry);
        self.write_atomic(&manifest).await
    }

    pub async fn move_to_pending_merge(&self, branch: &str, pr: PrInfo) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        let Some(idx) = manifest.ready.iter().position(|e| e.branch == branch) else {
            error!("manifest: {branch} not in ready, refusing move_to_pending_merge");
            bail!("branch {branch} is not in ready");
        };
        let mut entry = manifest.ready.remove(idx);
        entry.last_error = None;
        entry.base_main_sha = pr.base_main_sha;
        info!("manifest: {branch} -> pending_merge (PR #{})", pr.pr_number);
        manifest.pending_merge.push(ManifestPendingMergeEntry {
            entry,
            integration_branch: pr.integration_branch,
            pr_number: pr.pr_number,
            pr_url: pr.pr_url,
            conflicts_resolved: pr.conflicts_resolved,
        });
        self.write_atomic(&manifest).await
    }

    pub async fn move_to_merge_history(
        &self,
        branch: &str,
        merge_commit_sha: Option<String>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        let Some(idx) = manifest.pending_merge.iter().position(|e| e.entry.branch == branch)
        else {
            error!("manifest: {branch} not in pending_merge, refusing move_to_merge_history");
            bail!("branch {branch} is not in pending_merge");
        };
        let pending = manifest.pending_merge.remove(idx);
        info!("manifest: {branch} -> merge_history (PR #{})", pending.pr_number);
        manifest.merge_history.push(MergeHistoryEntry {
            branch: pending.entry.branch,
            pr_number: pending.pr_number,
            merge_commit_sha,
            merged_at: Utc::now(),
        });
        self.write_atomic(&manifest).await
    }

    /// Compensation path: pending_merge → ready, keeping the entry's data.
    pub async fn rollback_to_ready(&self, branch: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        let Some(idx) = manifest.pending_merge.iter().position(|e| e.entry.branch == branch)
        else {
            error!("manifest: {branch} not in pending_merge, refusing rollback_to_ready");
            bail!("branch {branch} is not in pending_merge");
        };
        let pending = manifest.pending_merge.remove(idx);
        info!("manifest: {branch} rolled back to ready");
        manifest.ready.push(pending.entry);
        self.write_atomic(&manifest).await
    }

    /// Drop a ready entry whose branch will never integrate (skip_merge
    /// disposal). The branch slot frees up for future runs.
    pub async fn remove_from_ready(&self, branch: &str) -> Result<ManifestReadyEntry> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        let Some(idx) = manifest.ready.iter().position(|e| e.branch == branch) else {
            bail!("branch {branch} is not in ready");
        };
        let entry = manifest.ready.remove(idx);
        info!("manifest: {branch} removed from ready");
        self.write_atomic(&manifest).await?;
        Ok(entry)
    }

    /// Record an integration failure against a ready entry.
    pub async fn set_ready_error(&self, branch: &str, error: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        let Some(entry) = manifest.ready.iter_mut().find(|e| e.branch == branch) else {
            bail!("branch {branch} is not in ready");
        };
        entry.last_error = Some(error.to_string());
        self.write_atomic(&manifest).await
    }

    /// Record a rebase outcome against a pending_merge entry.
    pub async fn set_pending_rebase(
        &self,
        branch: &str,
        new_base_sha: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut manifest = self.read().await?;
        let Some(pending) =
            manifest.pending_merge.iter_mut().find(|e| e.entry.branch == branch)
        else {
            bail!("branch {branch} is not in pending_merge");
        };
        if let Some(sha) = new_base_sha {
            pending.entry.base_main_sha = sha.to_string();
        }
        pending.entry.last_error = error.map(str::to_string);
        self.write_atomic(&manifest).await
    }

    pub async fn snapshot(&self) -> Result<Manifest> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn read(&self) -> Result<Manifest> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    async fn write_atomic(&self, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
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
