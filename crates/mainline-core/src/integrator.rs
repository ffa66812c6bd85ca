use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use crate::agent::{AgentProcess, ProcessSpec};
use crate::bus::EventBus;
use crate::circuit::{guarded, BreakerSet};
use crate::config::Config;
use crate::git::{pr_number_from_url, Gh, Git};
use crate::saga::{run_saga, SagaJournal, SagaStep};
use crate::types::{
    IntegratorResult, ManifestPendingMergeEntry, ManifestReadyEntry, PipelineEvent,
    PipelineEventType, RebaseResult,
};

/// Turns a ready branch into an open PR against the trunk.
///
/// The forward path is a saga: each step persists its journal transition
/// and carries a compensating action, so a failure unwinds the completed
/// steps in reverse and leaves the pipeline branch untouched.
pub struct Integrator {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    breakers: Arc<BreakerSet>,
    conflict_agent: Arc<dyn AgentProcess>,
}

struct IntegrateCtx {
    git: Git,
    gh: Gh,
    bus: Arc<EventBus>,
    breakers: Arc<BreakerSet>,
    conflict_agent: Arc<dyn AgentProcess>,
    config: Arc<Config>,
    request_id: String,
    branch: String,
    pipeline_branch: String,
    integration_branch: String,
    main: String,
    project_path: String,
    base_sha: Option<String>,
    conflicts_resolved: u32,
    pr_number: Option<u64>,
    pr_url: Option<String>,
}

impl Integrator {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        breakers: Arc<BreakerSet>,
        conflict_agent: Arc<dyn AgentProcess>,
    ) -> Self {
        Self { config, bus, breakers, conflict_agent }
    }

    pub async fn integrate(
        &self,
        entry: &ManifestReadyEntry,
        project_path: &str,
    ) -> IntegratorResult {
        let mut ctx = IntegrateCtx {
            git: Git::new(project_path),
            gh: Gh::new(project_path),
            bus: Arc::clone(&self.bus),
            breakers: Arc::clone(&self.breakers),
            conflict_agent: Arc::clone(&self.conflict_agent),
            config: Arc::clone(&self.config),
            request_id: entry.request_id.clone(),
            branch: entry.branch.clone(),
            pipeline_branch: entry.pipeline_branch.clone(),
            integration_branch: self.config.integration_branch_for(&entry.branch),
            main: self.config.branch.main.clone(),
            project_path: project_path.to_string(),
            base_sha: None,
            conflicts_resolved: 0,
            pr_number: None,
            pr_url: None,
        };

        let mut journal = match SagaJournal::begin(
            self.config.sagas_path(),
            "integrate",
            &entry.request_id,
        )
        .await
        {
            Ok(journal) => journal,
            Err(e) => {
                return IntegratorResult {
                    success: false,
                    error: Some(format!("open saga journal: {e:#}")),
                    ..Default::default()
                }
            }
        };

        self.bus
            .publish(PipelineEvent::new(
                PipelineEventType::IntegrationStarted,
                entry.request_id.clone(),
                json!({
                    "branch": entry.branch,
                    "pipeline_branch": entry.pipeline_branch,
                    "integration_branch": ctx.integration_branch,
                }),
            ))
            .await;

        match run_saga(&mut journal, INTEGRATE_STEPS, &mut ctx, None).await {
            Ok(()) => {
                info!(branch = %entry.branch, "integration complete, PR #{:?}", ctx.pr_number);
                IntegratorResult {
                    success: true,
                    pr_number: ctx.pr_number,
                    pr_url: ctx.pr_url,
                    integration_branch: Some(ctx.integration_branch),
                    base_main_sha: ctx.base_sha,
                    conflicts_resolved: Some(ctx.conflicts_resolved),
                    error: None,
                }
            }
            Err(e) => {
                let error = format!("{e:#}");
                self.bus
                    .publish(PipelineEvent::new(
                        PipelineEventType::IntegrationFailed,
                        entry.request_id.clone(),
                        json!({"branch": entry.branch, "error": error}),
                    ))
                    .await;
                IntegratorResult { success: false, error: Some(error), ..Default::default() }
            }
        }
    }

    /// Re-base a stale integration branch onto the moved trunk. Any failure
    /// aborts the rebase and returns to the trunk branch, leaving the PR at
    /// its previous head.
    pub async fn rebase(
        &self,
        pending: &ManifestPendingMergeEntry,
        project_path: &str,
        new_main_sha: &str,
    ) -> RebaseResult {
        let git = Git::new(project_path);
        let main = self.config.branch.main.clone();
        let integration_branch = pending.integration_branch.clone();
        let upstream = format!("origin/{main}");

        let attempt = async {
            git.fetch_origin().await?;
            git.checkout(&integration_branch).await?;
            let rebase = git.rebase_onto(&upstream).await?;
            let mut conflicts = 0u32;
            if !rebase.success() {
                let files = git.conflicted_files().await.unwrap_or_default();
                if files.is_empty() {
                    bail!("rebase onto {upstream} failed: {}", rebase.combined_output());
                }
                resolve_rebase_conflicts(
                    &self.config,
                    &self.breakers,
                    self.conflict_agent.as_ref(),
                    project_path,
                    &integration_branch,
                    &upstream,
                    &files,
                )
                .await?;
                conflicts = files.len() as u32;
            }
            let push = guarded(self.breakers.github.as_deref(), || async {
                let result = git.push_force_with_lease(&integration_branch).await?;
                if !result.success() {
                    bail!("push rejected: {}", result.stderr.trim());
                }
                Ok(())
            })
            .await;
            push?;
            anyhow::Ok(conflicts)
        }
        .await;

        match attempt {
            Ok(conflicts) => {
                git.checkout(&main).await.ok();
                self.bus
                    .publish(PipelineEvent::new(
                        PipelineEventType::IntegrationPrRebased,
                        pending.entry.request_id.clone(),
                        json!({
                            "branch": pending.entry.branch,
                            "integration_branch": integration_branch,
                            "base_main_sha": new_main_sha,
                            "conflicts_resolved": conflicts,
                        }),
                    ))
                    .await;
                RebaseResult { success: true, conflicts_resolved: Some(conflicts), error: None }
            }
            Err(e) => {
                git.rebase_abort().await.ok();
                git.checkout(&main).await.ok();
                let error = format!("{e:#}");
                warn!(branch = %pending.entry.branch, "rebase failed: {error}");
                self.bus
                    .publish(PipelineEvent::new(
                        PipelineEventType::IntegrationPrRebaseFailed,
                        pending.entry.request_id.clone(),
                        json!({"branch": pending.entry.branch, "error": error}),
                    ))
                    .await;
                RebaseResult { success: false, conflicts_resolved: None, error: Some(error) }
            }
        }
    }
}

// ── Saga steps ───────────────────────────────────────────────────────────

const INTEGRATE_STEPS: &[SagaStep<IntegrateCtx>] = &[
    SagaStep { name: "fetch_main", run: step_fetch_main, compensate: None },
    SagaStep {
        name: "create_integration_branch",
        run: step_create_integration_branch,
        compensate: Some(comp_delete_integration_branch),
    },
    SagaStep { name: "merge_pipeline", run: step_merge_pipeline, compensate: Some(comp_merge_abort) },
    SagaStep { name: "push_branch", run: step_push_branch, compensate: Some(comp_delete_remote) },
    // The PR stays visible on failure; there is nothing to compensate.
    SagaStep { name: "create_pr", run: step_create_pr, compensate: None },
    SagaStep { name: "checkout_main", run: step_checkout_main, compensate: None },
];

fn step_fetch_main(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.git.fetch_origin().await?;
        let sha = ctx.git.rev_parse(&format!("origin/{}", ctx.main)).await?;
        ctx.base_sha = Some(sha);
        Ok(())
    })
}

fn step_create_integration_branch(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        // A stale branch from an earlier failed attempt is discarded.
        ctx.git.delete_branch(&ctx.integration_branch).await?;
        ctx.git
            .checkout_new(&ctx.integration_branch, &format!("origin/{}", ctx.main))
            .await
    })
}

fn comp_delete_integration_branch(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        ctx.git.checkout(&ctx.main).await?;
        ctx.git.delete_branch(&ctx.integration_branch).await
    })
}

fn step_merge_pipeline(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let merge = ctx.git.merge_no_ff(&ctx.pipeline_branch).await?;
        if merge.success() {
            return Ok(());
        }
        let conflicted = ctx.git.conflicted_files().await.unwrap_or_default();
        if conflicted.is_empty() {
            bail!("merge of {} failed without conflicts: {}", ctx.pipeline_branch, merge.combined_output());
        }

        ctx.bus
            .publish(PipelineEvent::new(
                PipelineEventType::IntegrationConflictDetected,
                ctx.request_id.clone(),
                json!({"conflicted_files": conflicted, "count": conflicted.len()}),
            ))
            .await;

        let prompt = merge_conflict_prompt(&ctx.pipeline_branch, &ctx.integration_branch, &conflicted);
        let agent_cfg = &ctx.config.agents.conflict;
        let spec = ProcessSpec {
            prompt,
            model: agent_cfg.model.clone(),
            permission_mode: agent_cfg.permission_mode.clone(),
            max_turns: agent_cfg.max_turns,
            cwd: ctx.project_path.clone(),
            cancel: None,
        };
        let agent = Arc::clone(&ctx.conflict_agent);
        let outcome = guarded(ctx.breakers.claude.as_deref(), move || async move {
            agent.run(spec).await
        })
        .await?;
        if !outcome.success {
            bail!("conflict agent could not resolve the merge");
        }
        if ctx.git.merge_in_progress().await {
            bail!("conflict agent finished without committing the merge");
        }

        ctx.conflicts_resolved = conflicted.len() as u32;
        ctx.bus
            .publish(PipelineEvent::new(
                PipelineEventType::IntegrationConflictResolved,
                ctx.request_id.clone(),
                json!({"conflicted_files": conflicted, "count": conflicted.len()}),
            ))
            .await;
        Ok(())
    })
}

fn comp_merge_abort(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        // No-op when no merge is in progress.
        ctx.git.merge_abort().await.ok();
        Ok(())
    })
}

fn step_push_branch(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let git = &ctx.git;
        let branch = ctx.integration_branch.clone();
        guarded(ctx.breakers.github.as_deref(), move || async move {
            let result = git.push_force_with_lease(&branch).await?;
            if !result.success() {
                bail!("push rejected: {}", result.stderr.trim());
            }
            Ok(())
        })
        .await
    })
}

fn comp_delete_remote(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { ctx.git.delete_remote_branch(&ctx.integration_branch).await })
}

fn step_create_pr(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let title = format!("Integrate {}", ctx.branch);
        let body = format!(
            "Automated integration of `{}` via `{}`.",
            ctx.pipeline_branch, ctx.integration_branch,
        );
        let gh = &ctx.gh;
        let (main, head) = (ctx.main.clone(), ctx.integration_branch.clone());
        let url = guarded(ctx.breakers.github.as_deref(), move || async move {
            gh.pr_create(&main, &head, &title, &body).await
        })
        .await?;
        let number = pr_number_from_url(&url)
            .ok_or_else(|| anyhow!("could not parse PR number from {url}"))?;
        ctx.pr_number = Some(number);
        ctx.pr_url = Some(url.clone());
        ctx.bus
            .publish(PipelineEvent::new(
                PipelineEventType::IntegrationPrCreated,
                ctx.request_id.clone(),
                json!({
                    "pr_number": number,
                    "pr_url": url,
                    "integration_branch": ctx.integration_branch,
                }),
            ))
            .await;
        Ok(())
    })
}

fn step_checkout_main(ctx: &mut IntegrateCtx) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move { ctx.git.checkout(&ctx.main).await })
}

// ── Conflict agent prompts ───────────────────────────────────────────────

fn merge_conflict_prompt(pipeline_branch: &str, integration_branch: &str, files: &[String]) -> String {
    format!(
        "The merge of {pipeline_branch} into {integration_branch} stopped on conflicts in:\n\
        {}\n\n\
        Resolve every conflict marker in those files. Where the two sides contradict, prefer \
        the incoming branch ({pipeline_branch}). When everything is resolved, stage the files \
        with `git add` and complete the merge with `git commit --no-edit`. Do not touch any \
        other files.",
        files.iter().map(|f| format!("  - {f}")).collect::<Vec<_>>().join("\n"),
    )
}

async fn resolve_rebase_conflicts(
    config: &Config,
    breakers: &BreakerSet,
    agent: &dyn AgentProcess,
    project_path: &str,
    integration_branch: &str,
    upstream: &str,
    files: &[String],
) -> Result<()> {
    let prompt = format!(
        "A rebase of {integration_branch} onto {upstream} stopped on conflicts in:\n\
        {}\n\n\
        Resolve every conflict marker, stage the files with `git add`, and run \
        `git rebase --continue` until the rebase finishes. Where the two sides contradict, \
        prefer the branch being rebased ({integration_branch}). Do not touch any other files.",
        files.iter().map(|f| format!("  - {f}")).collect::<Vec<_>>().join("\n"),
    );
    let agent_cfg = &config.agents.conflict;
    let spec = ProcessSpec {
        prompt,
        model: agent_cfg.model.clone(),
        permission_mode: agent_cfg.permission_mode.clone(),
        max_turns: agent_cfg.max_turns,
        cwd: project_path.to_string(),
        cancel: None,
    };
    let outcome = guarded(breakers.claude.as_deref(), move || async move {
        agent.run(spec).await
    })
    .await?;
    if !outcome.success {
        bail!("conflict agent could not resolve the rebase");
    }
    Ok(())
}
