use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::git::Git;
use crate::integrator::Integrator;
use crate::manifest::{ManifestManager, PrInfo};
use crate::types::{Manifest, ManifestReadyEntry};

/// Base for the exponential cooldown applied to a branch whose integration
/// failed; doubles per consecutive failure.
const COOLDOWN_BASE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy)]
struct Cooldown {
    failures: u32,
    until: Instant,
}

/// Priority-ordered scheduler of ready branches against the manifest.
///
/// One cycle at a time per director: a cycle that finds the lock held
/// returns immediately. The director is the only caller of the integrator,
/// which serializes integration per project.
pub struct Director {
    config: Arc<Config>,
    manifest: Arc<ManifestManager>,
    integrator: Arc<Integrator>,
    run_lock: tokio::sync::Mutex<()>,
    cooldowns: Mutex<HashMap<String, Cooldown>>,
}

impl Director {
    pub fn new(
        config: Arc<Config>,
        manifest: Arc<ManifestManager>,
        integrator: Arc<Integrator>,
    ) -> Self {
        Self {
            config,
            manifest,
            integrator,
            run_lock: tokio::sync::Mutex::new(()),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// One scheduling cycle: rebase drifted pending PRs, then integrate
    /// eligible ready entries in priority order.
    pub async fn run_cycle(&self, project_path: &str) -> Result<()> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            info!("director cycle already running, skipping");
            return Ok(());
        };

        let manifest = self.manifest.snapshot().await?;
        self.rebase_drifted(&manifest, project_path).await;

        // skip_merge entries never integrate; drop them so the branch slot
        // frees up. The manifest writer retires such runs before they reach
        // ready, so anything found here came from an edited manifest.
        for entry in manifest.ready.iter().filter(|e| e.skip_merge) {
            match self.manifest.remove_from_ready(&entry.branch).await {
                Ok(_) => info!(branch = %entry.branch, "skip_merge entry retired from ready"),
                Err(e) => warn!(branch = %entry.branch, "retire skip_merge entry: {e:#}"),
            }
        }

        let eligible = self.eligible_entries(&manifest);
        for entry in eligible {
            let result = self.integrator.integrate(&entry, project_path).await;
            if result.success {
                let pr = PrInfo {
                    integration_branch: result
                        .integration_branch
                        .unwrap_or_else(|| self.config.integration_branch_for(&entry.branch)),
                    pr_number: result.pr_number.unwrap_or(0),
                    pr_url: result.pr_url.unwrap_or_default(),
                    conflicts_resolved: result.conflicts_resolved.unwrap_or(0),
                    base_main_sha: result.base_main_sha.unwrap_or(entry.base_main_sha.clone()),
                };
                if let Err(e) = self.manifest.move_to_pending_merge(&entry.branch, pr).await {
                    warn!(branch = %entry.branch, "move_to_pending_merge: {e:#}");
                }
                self.clear_cooldown(&entry.branch);
            } else {
                let error = result.error.unwrap_or_else(|| "integration failed".into());
                if let Err(e) = self.manifest.set_ready_error(&entry.branch, &error).await {
                    warn!(branch = %entry.branch, "set_ready_error: {e:#}");
                }
                self.bump_cooldown(&entry.branch);
            }
        }
        Ok(())
    }

    /// Rebase every pending PR whose recorded trunk sha no longer matches
    /// origin. A failed rebase keeps the entry in pending_merge with
    /// `last_error` set; the PR stays at its previous head.
    async fn rebase_drifted(&self, manifest: &Manifest, project_path: &str) {
        if manifest.pending_merge.is_empty() {
            return;
        }
        let git = Git::new(project_path);
        if let Err(e) = git.fetch_origin().await {
            warn!("director: fetch before drift check: {e:#}");
            return;
        }
        let main_sha = match git.rev_parse(&format!("origin/{}", self.config.branch.main)).await {
            Ok(sha) => sha,
            Err(e) => {
                warn!("director: resolve trunk sha: {e:#}");
                return;
            }
        };

        for pending in &manifest.pending_merge {
            if pending.entry.base_main_sha == main_sha {
                continue;
            }
            info!(
                branch = %pending.entry.branch,
                "trunk moved ({} -> {}), rebasing", pending.entry.base_main_sha, main_sha,
            );
            let result = self.integrator.rebase(pending, project_path, &main_sha).await;
            let update = if result.success {
                self.manifest
                    .set_pending_rebase(&pending.entry.branch, Some(&main_sha), None)
                    .await
            } else {
                self.manifest
                    .set_pending_rebase(&pending.entry.branch, None, result.error.as_deref())
                    .await
            };
            if let Err(e) = update {
                warn!(branch = %pending.entry.branch, "record rebase outcome: {e:#}");
            }
        }
    }

    /// Ready entries whose dependencies are merged and whose cooldown has
    /// lapsed, lowest priority ordinal first, ties broken by ready_at.
    fn eligible_entries(&self, manifest: &Manifest) -> Vec<ManifestReadyEntry> {
        let now = Instant::now();
        let cooldowns = match self.cooldowns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut eligible: Vec<ManifestReadyEntry> = manifest
            .ready
            .iter()
            .filter(|e| !e.skip_merge)
            .filter(|e| e.depends_on.iter().all(|dep| manifest.in_merge_history(dep)))
            .filter(|e| cooldowns.get(&e.branch).map_or(true, |c| c.until <= now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.ready_at.cmp(&b.ready_at)));
        eligible
    }

    fn bump_cooldown(&self, branch: &str) {
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let failures = cooldowns.get(branch).map_or(0, |c| c.failures) + 1;
        let delay = COOLDOWN_BASE * 2u32.saturating_pow(failures - 1).min(64);
        cooldowns.insert(branch.to_string(), Cooldown { failures, until: Instant::now() + delay });
        warn!(branch, "integration failed {failures} time(s), cooling down {delay:?}");
    }

    fn clear_cooldown(&self, branch: &str) {
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldowns.remove(branch);
    }
}
