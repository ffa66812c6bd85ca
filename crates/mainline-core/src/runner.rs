use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::AgentExecutor;
use crate::bus::EventBus;
use crate::config::Config;
use crate::fsm::{pipeline_machine, StateMachine};
use crate::git::Git;
use crate::idempotency::{fingerprint, IdempotencyGuard};
use crate::quality::{QualityOutcome, QualityPipeline};
use crate::types::{
    AgentStatus, DiffStats, PipelineEvent, PipelineEventType, PipelineRequest, PipelineState,
    PipelineStatus, Tier,
};

/// Terminal states are kept this long for late status queries.
const STATE_RETENTION: Duration = Duration::from_secs(60);
/// Hard cap on retained non-running entries; oldest are pruned first.
const STATE_CAP: usize = 500;

/// Per-request state machine and quality fan-out driver.
///
/// Runs are concurrent across requests; each run is one logical task whose
/// internal parallelism is its quality agents. All shared maps are mutated
/// only here; readers get snapshots.
pub struct PipelineRunner {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    quality: QualityPipeline,
    idempotency: Arc<IdempotencyGuard>,
    states: Mutex<HashMap<String, PipelineState>>,
    machines: Mutex<HashMap<String, StateMachine<PipelineStatus>>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    /// branch → request_id of its active run.
    active_branches: Mutex<HashMap<String, String>>,
}

enum RunEnd {
    Finished(Result<PipelineStatus>),
    Stopped,
    TimedOut,
}

impl PipelineRunner {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        executor: Arc<dyn AgentExecutor>,
        idempotency: Arc<IdempotencyGuard>,
    ) -> Arc<Self> {
        Arc::new(Self {
            quality: QualityPipeline::new(executor, Arc::clone(&config)),
            config,
            bus,
            idempotency,
            states: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            active_branches: Mutex::new(HashMap::new()),
        })
    }

    // ── Intake ────────────────────────────────────────────────────────────

    /// Accept a request and spawn its run. Returns the request id.
    pub async fn run(self: &Arc<Self>, mut request: PipelineRequest) -> Result<String> {
        if request.branch.is_empty() {
            bail!("request has no branch");
        }
        if request.worktree_path.is_empty() {
            bail!("request has no worktree_path");
        }
        if request.request_id.is_empty() {
            request.request_id = Uuid::new_v4().to_string();
        }
        let request_id = request.request_id.clone();

        let fp = fingerprint("pipeline.run", &request_id);
        if !self.idempotency.claim(&fp).await? {
            bail!("request {request_id} already in flight");
        }

        let holder = {
            let mut active = lock(&self.active_branches);
            match active.get(&request.branch).cloned() {
                Some(other) => Some(other),
                None => {
                    active.insert(request.branch.clone(), request_id.clone());
                    None
                }
            }
        };
        if let Some(other) = holder {
            self.idempotency.release(&fp).await.ok();
            bail!("branch {} already has an active pipeline ({other})", request.branch);
        }

        self.prune_retained();
        let state = PipelineState {
            request_id: request_id.clone(),
            branch: request.branch.clone(),
            status: PipelineStatus::Accepted,
            tier: None,
            pipeline_branch: self.config.pipeline_branch_for(&request.branch),
            started_at: Utc::now(),
            completed_at: None,
            events_count: 0,
            corrections_count: 0,
            corrections_applied: Vec::new(),
        };
        lock(&self.states).insert(request_id.clone(), state);
        lock(&self.machines).insert(request_id.clone(), pipeline_machine());
        let token = CancellationToken::new();
        lock(&self.tokens).insert(request_id.clone(), token.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_to_completion(request, token).await;
        });
        Ok(request_id)
    }

    /// Cancel a run. Returns false when the id has no live run.
    pub fn stop(&self, request_id: &str) -> bool {
        match lock(&self.tokens).get(request_id) {
            Some(token) => {
                info!(request_id, "pipeline stop requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for token in lock(&self.tokens).values() {
            token.cancel();
        }
    }

    pub fn status(&self, request_id: &str) -> Option<PipelineState> {
        lock(&self.states).get(request_id).cloned()
    }

    pub fn is_running(&self, request_id: &str) -> bool {
        lock(&self.states)
            .get(request_id)
            .is_some_and(|s| !s.status.is_terminal())
    }

    pub fn list_all(&self) -> Vec<PipelineState> {
        let mut states: Vec<_> = lock(&self.states).values().cloned().collect();
        states.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        states
    }

    // ── Run driver ────────────────────────────────────────────────────────

    async fn run_to_completion(self: Arc<Self>, request: PipelineRequest, token: CancellationToken) {
        let request_id = request.request_id.clone();
        let deadline_ms = self.config.pipeline_timeout_ms;

        let end = tokio::select! {
            result = self.lifecycle(&request, &token) => RunEnd::Finished(result),
            _ = token.cancelled() => RunEnd::Stopped,
            _ = tokio::time::sleep(Duration::from_millis(deadline_ms)), if deadline_ms > 0 => {
                RunEnd::TimedOut
            }
        };

        let branch = &request.branch;
        match end {
            RunEnd::Finished(Ok(_terminal)) => {}
            RunEnd::Finished(Err(_)) if token.is_cancelled() => {
                info!(request_id = %request_id, "pipeline stopped");
                self.emit(
                    &request_id,
                    PipelineEventType::PipelineStopped,
                    json!({"reason": "stopped", "branch": branch}),
                )
                .await;
                self.transition(&request_id, PipelineStatus::Failed);
            }
            RunEnd::Finished(Err(e)) => {
                error!(request_id = %request_id, "pipeline errored: {e:#}");
                self.emit(
                    &request_id,
                    PipelineEventType::PipelineError,
                    json!({"error": format!("{e:#}"), "branch": branch}),
                )
                .await;
                self.transition(&request_id, PipelineStatus::Error);
            }
            RunEnd::Stopped => {
                info!(request_id = %request_id, "pipeline stopped");
                self.emit(
                    &request_id,
                    PipelineEventType::PipelineStopped,
                    json!({"reason": "stopped", "branch": branch}),
                )
                .await;
                self.transition(&request_id, PipelineStatus::Failed);
            }
            RunEnd::TimedOut => {
                warn!(request_id = %request_id, "pipeline deadline of {deadline_ms} ms exceeded");
                self.emit(
                    &request_id,
                    PipelineEventType::PipelineFailed,
                    json!({"reason": "timeout", "branch": branch}),
                )
                .await;
                self.transition(&request_id, PipelineStatus::Failed);
            }
        }

        self.finalize(&request).await;
    }

    /// Steps 2–9 of the run lifecycle. Terminal events for the normal paths
    /// are published here; the caller covers stop/timeout/error.
    async fn lifecycle(
        self: &Arc<Self>,
        request: &PipelineRequest,
        token: &CancellationToken,
    ) -> Result<PipelineStatus> {
        let request_id = &request.request_id;
        let request_config = request.config.clone().unwrap_or_default();

        self.publish(
            PipelineEvent::new(
                PipelineEventType::PipelineAccepted,
                request_id.clone(),
                json!({
                    "branch": request.branch,
                    "worktree_path": request.worktree_path,
                    "project_id": request.project_id,
                }),
            )
            .with_metadata(request.metadata.clone().unwrap_or(Value::Null)),
        )
        .await;
        info!(request_id = %request_id, "pipeline run initialized");
        info!(
            request_id = %request_id,
            "accepted branch {} for quality review ({})",
            request.branch, request.worktree_path,
        );

        // Diff stats feed both the classifier and the started event.
        // Listing changes is a soft step: failure degrades to an empty diff.
        let base_ref = request
            .base_branch
            .clone()
            .unwrap_or_else(|| format!("origin/{}", self.config.branch.main));
        let git = Git::new(&request.worktree_path);
        let diff = match git.diff_stats(&request.worktree_path, &base_ref).await {
            Ok(diff) => diff,
            Err(e) => {
                warn!(request_id = %request_id, "diff stats against {base_ref} failed: {e:#}");
                DiffStats::default()
            }
        };

        let tier = request_config.tier.unwrap_or_else(|| classify_tier(&diff, &self.config));
        self.emit(
            request_id,
            PipelineEventType::PipelineTierClassified,
            json!({
                "tier": tier,
                "files_changed": diff.files_changed,
                "lines_changed": diff.total_lines(),
            }),
        )
        .await;
        self.transition(request_id, PipelineStatus::Running);
        if let Some(state) = lock(&self.states).get_mut(request_id) {
            state.tier = Some(tier);
        }

        let agent_names = request_config
            .agents
            .clone()
            .unwrap_or_else(|| crate::roles::names_for_tier(tier, &self.config));
        let roles = crate::roles::resolve(&agent_names, &self.config);
        let model_count = {
            let mut models: Vec<&str> = roles.iter().map(|r| r.model.as_str()).collect();
            models.sort_unstable();
            models.dedup();
            models.len()
        };

        self.emit(
            request_id,
            PipelineEventType::PipelineStarted,
            json!({
                "tier": tier,
                "agents": agent_names,
                "model_count": model_count,
            }),
        )
        .await;

        let outcome = if diff.files_changed == 0 {
            info!(request_id = %request_id, "empty diff, no agents dispatched");
            QualityOutcome {
                agent_results: Vec::new(),
                corrections_applied: Vec::new(),
                overall: AgentStatus::Passed,
            }
        } else {
            // Mirror correction cycles into the status machine.
            let (phase_tx, mut phase_rx) = tokio::sync::mpsc::unbounded_channel::<bool>();
            let watcher = {
                let this = Arc::clone(self);
                let rid = request_id.clone();
                tokio::spawn(async move {
                    while let Some(correcting) = phase_rx.recv().await {
                        let to = if correcting {
                            PipelineStatus::Correcting
                        } else {
                            PipelineStatus::Running
                        };
                        this.transition(&rid, to);
                    }
                })
            };
            let outcome = self
                .quality
                .run(request, tier, &roles, &diff, token, Some(&phase_tx))
                .await;
            drop(phase_tx);
            watcher.await.ok();
            outcome?
        };

        if token.is_cancelled() {
            bail!("cancelled during quality fan-out");
        }

        {
            let mut states = lock(&self.states);
            if let Some(state) = states.get_mut(request_id) {
                state.corrections_count = outcome.corrections_applied.len() as u32;
                state.corrections_applied = outcome.corrections_applied.clone();
            }
        }

        let per_agent: serde_json::Map<String, Value> = outcome
            .agent_results
            .iter()
            .map(|r| (r.agent.clone(), json!(r.status)))
            .collect();

        let terminal = match outcome.overall {
            AgentStatus::Error => {
                self.emit(
                    request_id,
                    PipelineEventType::PipelineError,
                    json!({
                        "error": "one or more agents errored",
                        "branch": request.branch,
                        "result": per_agent,
                        "agent_results": outcome.agent_results,
                    }),
                )
                .await;
                self.transition(request_id, PipelineStatus::Error);
                PipelineStatus::Error
            }
            AgentStatus::Failed => {
                self.emit(
                    request_id,
                    PipelineEventType::PipelineFailed,
                    json!({
                        "reason": "quality_gate",
                        "branch": request.branch,
                        "result": per_agent,
                        "agent_results": outcome.agent_results,
                        "corrections_applied": outcome.corrections_applied,
                    }),
                )
                .await;
                self.transition(request_id, PipelineStatus::Failed);
                PipelineStatus::Failed
            }
            AgentStatus::Passed => {
                // Request metadata (priority, depends_on) rides along for
                // the manifest writer.
                self.publish(
                    PipelineEvent::new(
                        PipelineEventType::PipelineCompleted,
                        request_id.clone(),
                        json!({
                            "branch": request.branch,
                            "base_branch": request.base_branch,
                            "worktree_path": request.worktree_path,
                            "tier": tier,
                            "result": per_agent,
                            "agent_results": outcome.agent_results,
                            "corrections_applied": outcome.corrections_applied,
                            "skip_merge": request_config.skip_merge,
                        }),
                    )
                    .with_metadata(request.metadata.clone().unwrap_or(Value::Null)),
                )
                .await;
                self.transition(request_id, PipelineStatus::Approved);
                PipelineStatus::Approved
            }
        };
        Ok(terminal)
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────

    fn transition(&self, request_id: &str, to: PipelineStatus) {
        let mut machines = lock(&self.machines);
        let Some(machine) = machines.get_mut(request_id) else { return };
        if machine.transition(to) {
            drop(machines);
            if let Some(state) = lock(&self.states).get_mut(request_id) {
                state.status = to;
            }
        }
    }

    async fn emit(&self, request_id: &str, event_type: PipelineEventType, data: Value) {
        self.publish(PipelineEvent::new(event_type, request_id, data)).await;
    }

    async fn publish(&self, event: PipelineEvent) {
        if let Some(state) = lock(&self.states).get_mut(&event.request_id) {
            state.events_count += 1;
        }
        self.bus.publish(event).await;
    }

    /// Drop live handles, release the idempotency claim, and retire the
    /// state entry after the retention window.
    async fn finalize(self: &Arc<Self>, request: &PipelineRequest) {
        let request_id = request.request_id.clone();
        if let Some(state) = lock(&self.states).get_mut(&request_id) {
            state.completed_at = Some(Utc::now());
        }
        lock(&self.tokens).remove(&request_id);
        lock(&self.active_branches).remove(&request.branch);

        let fp = fingerprint("pipeline.run", &request_id);
        if let Err(e) = self.idempotency.release(&fp).await {
            warn!(request_id = %request_id, "release idempotency claim: {e:#}");
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(STATE_RETENTION).await;
            lock(&this.states).remove(&request_id);
            lock(&this.machines).remove(&request_id);
        });
    }

    /// Oldest-first prune of retained terminal entries past the cap.
    fn prune_retained(&self) {
        let mut states = lock(&self.states);
        if states.len() < STATE_CAP {
            return;
        }
        let mut retained: Vec<(String, chrono::DateTime<Utc>)> = states
            .iter()
            .filter(|(_, s)| s.status.is_terminal())
            .map(|(id, s)| (id.clone(), s.completed_at.unwrap_or(s.started_at)))
            .collect();
        retained.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = states.len().saturating_sub(STATE_CAP - 1);
        let mut machines = lock(&self.machines);
        for (id, _) in retained.into_iter().take(excess) {
            states.remove(&id);
            machines.remove(&id);
        }
    }
}

/// Smallest tier whose bounds (inclusive) hold the change; a missing bound
/// is infinite, so `large` always matches.
pub fn classify_tier(diff: &DiffStats, config: &Config) -> Tier {
    let lines = diff.total_lines();
    for tier in [Tier::Small, Tier::Medium] {
        let bounds = config.tiers.get(tier);
        let files_ok = bounds.max_files.map_or(true, |max| diff.files_changed <= max);
        let lines_ok = bounds.max_lines.map_or(true, |max| lines <= max);
        if files_ok && lines_ok {
            return tier;
        }
    }
    Tier::Large
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
