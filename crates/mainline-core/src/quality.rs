use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentContext, AgentExecutor};
use crate::config::Config;
use crate::types::{
    AgentResult, AgentRole, AgentRunMetadata, AgentStatus, DiffStats, Finding, FindingSeverity,
    PipelineRequest, Tier,
};

/// Aggregate outcome of one quality fan-out, corrections included.
#[derive(Debug, Clone)]
pub struct QualityOutcome {
    pub agent_results: Vec<AgentResult>,
    pub corrections_applied: Vec<String>,
    pub overall: AgentStatus,
}

/// Runs the tier's agents in parallel and drives the correction loop.
pub struct QualityPipeline {
    executor: Arc<dyn AgentExecutor>,
    config: Arc<Config>,
}

impl QualityPipeline {
    pub fn new(executor: Arc<dyn AgentExecutor>, config: Arc<Config>) -> Self {
        Self { executor, config }
    }

    /// `correcting` (when given) is signalled true at the start of each
    /// correction cycle and false after it, so the runner can mirror the
    /// running ↔ correcting status transitions.
    pub async fn run(
        &self,
        request: &PipelineRequest,
        _tier: Tier,
        roles: &[AgentRole],
        diff: &DiffStats,
        cancel: &CancellationToken,
        correcting: Option<&mpsc::UnboundedSender<bool>>,
    ) -> Result<QualityOutcome> {
        let mut results = self.fan_out(request, roles, diff, cancel).await;
        let mut corrections_applied: Vec<String> = Vec::new();

        // Correction loop: agents that failed but already applied fixes get
        // re-verified, with exponential backoff between cycles.
        let budget = self.config.auto_correction.max_attempts;
        for attempt in 0..budget {
            if cancel.is_cancelled() {
                break;
            }
            let rerun: Vec<AgentRole> = roles
                .iter()
                .filter(|role| {
                    results
                        .iter()
                        .find(|r| r.agent == role.name)
                        .is_some_and(|r| r.status == AgentStatus::Failed && r.has_applied_fixes())
                })
                .cloned()
                .collect();
            if rerun.is_empty() {
                break;
            }

            if let Some(tx) = correcting {
                let _ = tx.send(true);
            }
            let backoff = self.backoff(attempt);
            info!(
                request_id = %request.request_id,
                "correction cycle {} for [{}] after {:?}",
                attempt + 1,
                rerun.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", "),
                backoff,
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => break,
            }

            let fresh = self.fan_out(request, &rerun, diff, cancel).await;
            for result in fresh {
                corrections_applied.push(result.agent.clone());
                if let Some(slot) = results.iter_mut().find(|r| r.agent == result.agent) {
                    *slot = result;
                } else {
                    results.push(result);
                }
            }
            if let Some(tx) = correcting {
                let _ = tx.send(false);
            }
        }

        let overall = overall_status(&results);
        Ok(QualityOutcome { agent_results: results, corrections_applied, overall })
    }

    /// Run every role concurrently; an executor error becomes an
    /// error-status result rather than aborting the siblings.
    async fn fan_out(
        &self,
        request: &PipelineRequest,
        roles: &[AgentRole],
        diff: &DiffStats,
        cancel: &CancellationToken,
    ) -> Vec<AgentResult> {
        let mut handles = Vec::with_capacity(roles.len());
        for role in roles {
            let executor = Arc::clone(&self.executor);
            let role = role.clone();
            let ctx = AgentContext {
                request_id: request.request_id.clone(),
                branch: request.branch.clone(),
                worktree_path: request.worktree_path.clone(),
                diff: diff.clone(),
                cancel: cancel.clone(),
            };
            handles.push(tokio::spawn(async move {
                let name = role.name.clone();
                match executor.run_agent(&role, ctx).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("agent '{name}' errored: {e:#}");
                        error_result(&name, &role, &format!("{e:#}"))
                    }
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, role) in handles.into_iter().zip(roles) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    warn!("agent '{}' panicked: {join_err}", role.name);
                    results.push(error_result(&role.name, role, &join_err.to_string()));
                }
            }
        }
        results
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let cfg = &self.config.auto_correction;
        let ms = cfg.backoff_base_ms as f64 * cfg.backoff_factor.powi(attempt as i32);
        Duration::from_millis(ms as u64)
    }
}

/// error > failed > passed.
pub fn overall_status(results: &[AgentResult]) -> AgentStatus {
    if results.iter().any(|r| r.status == AgentStatus::Error) {
        AgentStatus::Error
    } else if results.iter().any(|r| r.status == AgentStatus::Failed) {
        AgentStatus::Failed
    } else {
        AgentStatus::Passed
    }
}

fn error_result(name: &str, role: &AgentRole, error: &str) -> AgentResult {
    AgentResult {
        agent: name.to_string(),
        status: AgentStatus::Error,
        findings: vec![Finding {
            severity: FindingSeverity::High,
            description: format!("agent execution error: {error}"),
            file: None,
            line: None,
            fix_applied: false,
            fix_description: None,
        }],
        fixes_applied: 0,
        metadata: AgentRunMetadata {
            model: role.model.clone(),
            provider: role.provider.clone(),
            ..Default::default()
        },
    }
}
