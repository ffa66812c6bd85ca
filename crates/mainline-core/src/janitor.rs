use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::git::Git;
use crate::manifest::ManifestManager;
use crate::types::{BranchStage, PipelineEvent};

/// Branch cleanup at the lifecycle exits.
///
/// Merged PRs advance the manifest and drop the pipeline and integration
/// branches. Runs that end without a merge take the `running → removed`
/// exit: failed, errored, and stopped runs lose their pipeline branch
/// unless `cleanup.keep_on_failure` preserves failed work for inspection,
/// and completed runs flagged `skip_merge` are retired the same way. A
/// periodic sweep prunes integration branches merged longer ago than
/// `cleanup.stale_branch_days`.
pub struct Janitor {
    config: Arc<Config>,
    manifest: Arc<ManifestManager>,
    project_path: String,
}

impl Janitor {
    pub fn new(
        config: Arc<Config>,
        manifest: Arc<ManifestManager>,
        project_path: impl Into<String>,
    ) -> Self {
        Self { config, manifest, project_path: project_path.into() }
    }

    /// Handle one `integration.pr.merged` event: record the merge in the
    /// manifest, then drop the now-dead branches.
    pub async fn on_merged(&self, event: &PipelineEvent) {
        let data = &event.data;
        let Some(branch) = data.get("branch").and_then(Value::as_str) else {
            warn!("integration.pr.merged without branch field");
            return;
        };
        let merge_sha = data
            .get("merge_commit_sha")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Err(e) = self.manifest.move_to_merge_history(branch, merge_sha).await {
            warn!(branch, "move_to_merge_history: {e:#}");
        }

        let git = Git::new(&self.project_path);
        let pipeline_branch = self.config.pipeline_branch_for(branch);
        let integration_branch = data
            .get("integration_branch")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.config.integration_branch_for(branch));

        for dead in [pipeline_branch.as_str(), integration_branch.as_str()] {
            git.delete_branch(dead).await.ok();
            if let Err(e) = git.delete_remote_branch(dead).await {
                // The merge usually deletes the remote head already.
                info!(branch = dead, "remote delete skipped: {e:#}");
            }
        }
        info!(branch, "merged branch cleaned up");
    }

    /// Handle a `pipeline.failed` / `pipeline.error` / `pipeline.stopped`
    /// event: the run will never integrate, so its branch leaves the
    /// lifecycle unless failed work is being kept for inspection.
    pub async fn on_run_failed(&self, event: &PipelineEvent) {
        let Some(branch) = event.data.get("branch").and_then(Value::as_str) else {
            warn!(request_id = %event.request_id, "terminal event without branch field");
            return;
        };
        if self.config.cleanup.keep_on_failure {
            info!(branch, "keeping pipeline branch of failed run for inspection");
            return;
        }
        self.retire(branch).await;
    }

    /// Terminal `removed` disposition for a branch that never reached the
    /// manifest: delete its pipeline branch locally and remotely.
    pub async fn retire(&self, branch: &str) {
        // Removal is only a legal exit from the running stage; a branch the
        // manifest still tracks is past it (its ready or pending entry owns
        // the pipeline branch).
        match self.manifest.snapshot().await {
            Ok(manifest) => {
                if let Some(stage) = manifest.container_of(branch) {
                    warn!(branch, "refusing to retire branch in {stage:?}");
                    return;
                }
            }
            Err(e) => {
                warn!(branch, "janitor: manifest snapshot: {e:#}");
                return;
            }
        }

        let git = Git::new(&self.project_path);
        let pipeline_branch = self.config.pipeline_branch_for(branch);
        git.delete_branch(&pipeline_branch).await.ok();
        if let Err(e) = git.delete_remote_branch(&pipeline_branch).await {
            info!(branch = %pipeline_branch, "remote delete skipped: {e:#}");
        }
        info!(branch, stage = ?BranchStage::Removed, "branch retired");
    }

    /// Delete integration branches of entries merged long ago.
    pub async fn sweep_stale(&self) {
        let manifest = match self.manifest.snapshot().await {
            Ok(m) => m,
            Err(e) => {
                warn!("janitor: manifest snapshot: {e:#}");
                return;
            }
        };
        let horizon = Utc::now() - Duration::days(self.config.cleanup.stale_branch_days as i64);
        let git = Git::new(&self.project_path);
        for entry in &manifest.merge_history {
            if entry.merged_at > horizon {
                continue;
            }
            let integration_branch = self.config.integration_branch_for(&entry.branch);
            git.delete_branch(&integration_branch).await.ok();
        }
    }
}
