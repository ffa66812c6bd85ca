use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentProcess, ProcessSpec};
use crate::bus::EventBus;
use crate::circuit::{guarded, BreakerSet};
use crate::config::{Config, ReactionAction, ReactionConfig};
use crate::git::Gh;
use crate::sessions::{AttemptKind, SessionStore};
use crate::types::{PipelineEvent, PipelineEventType, Session, SessionStatus};

/// Event-driven reactors for CI failure, review feedback, and stuck agents.
///
/// Each reactor carries a bounded retry budget; exhausting it escalates the
/// session instead of respawning again. Stuck timers are armed per session
/// in wall-clock minutes and cleared on any terminal session event.
pub struct ReactionEngine {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionStore>,
    agent: Arc<dyn AgentProcess>,
    breakers: Arc<BreakerSet>,
    project_path: String,
    stuck_timers: Mutex<HashMap<String, CancellationToken>>,
}

impl ReactionEngine {
    pub fn new(
        config: Arc<Config>,
        bus: Arc<EventBus>,
        sessions: Arc<SessionStore>,
        agent: Arc<dyn AgentProcess>,
        breakers: Arc<BreakerSet>,
        project_path: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            sessions,
            agent,
            breakers,
            project_path: project_path.into(),
            stuck_timers: Mutex::new(HashMap::new()),
        })
    }

    /// Event types the engine reacts to; the server wires a subscription
    /// over exactly this set.
    pub fn trigger_types() -> &'static [PipelineEventType] {
        &[
            PipelineEventType::SessionReviewRequested,
            PipelineEventType::SessionChangesRequested,
            PipelineEventType::SessionCiPassed,
            PipelineEventType::SessionCiFailed,
            PipelineEventType::SessionImplementing,
            PipelineEventType::SessionPrCreated,
            PipelineEventType::SessionMerged,
            PipelineEventType::SessionFailed,
            PipelineEventType::SessionEscalated,
        ]
    }

    pub async fn handle(self: &Arc<Self>, event: &PipelineEvent) {
        let session_id = session_id_of(event);
        match event.event_type {
            PipelineEventType::SessionReviewRequested => {
                self.ensure_session(&session_id, &event.data).await;
                if event.data.get("approved").and_then(Value::as_bool) == Some(true) {
                    self.sessions.set_approved(&session_id, true).await.ok();
                }
            }
            PipelineEventType::SessionCiFailed => {
                self.ensure_session(&session_id, &event.data).await;
                self.react_with_budget(
                    &session_id,
                    event,
                    AttemptKind::Ci,
                    self.config.reactions.ci_failed.clone(),
                    "CI failed",
                )
                .await;
            }
            PipelineEventType::SessionChangesRequested => {
                self.ensure_session(&session_id, &event.data).await;
                self.sessions.set_approved(&session_id, false).await.ok();
                self.react_with_budget(
                    &session_id,
                    event,
                    AttemptKind::Review,
                    self.config.reactions.changes_requested.clone(),
                    "Changes requested",
                )
                .await;
            }
            PipelineEventType::SessionCiPassed => {
                self.on_ci_passed(&session_id, event).await;
            }
            PipelineEventType::SessionImplementing | PipelineEventType::SessionPrCreated => {
                self.arm_stuck_timer(&session_id);
            }
            PipelineEventType::SessionMerged => {
                self.clear_stuck_timer(&session_id);
                if let Err(e) = self.sessions.transition(&session_id, SessionStatus::Merged).await {
                    warn!(session_id = %session_id, "mark merged: {e:#}");
                }
            }
            PipelineEventType::SessionFailed | PipelineEventType::SessionEscalated => {
                self.clear_stuck_timer(&session_id);
            }
            _ => {}
        }
    }

    // ── Budgeted reactors ─────────────────────────────────────────────────

    async fn react_with_budget(
        self: &Arc<Self>,
        session_id: &str,
        event: &PipelineEvent,
        kind: AttemptKind,
        reaction: Option<ReactionConfig>,
        what: &str,
    ) {
        let Some(reaction) = reaction else { return };
        let attempts = match self.sessions.increment_attempt(session_id, kind).await {
            Ok(n) => n,
            Err(e) => {
                warn!(session_id = %session_id, "increment attempt: {e:#}");
                return;
            }
        };

        if attempts > reaction.max_retries {
            let reason = format!("{what} {attempts} times — exceeded retry budget");
            self.escalate(session_id, event.event_type, attempts, reaction.max_retries, &reason)
                .await;
            return;
        }

        match reaction.action {
            ReactionAction::RespawnAgent => {
                self.respawn(session_id, event, &reaction).await;
            }
            ReactionAction::Notify => {}
            ReactionAction::Escalate => {
                let reason = reaction
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{what} for session {session_id}"));
                self.escalate(session_id, event.event_type, attempts, reaction.max_retries, &reason)
                    .await;
                return;
            }
            ReactionAction::AutoMerge => {
                warn!(session_id = %session_id, "auto_merge is not a valid action for {what}");
            }
        }

        self.emit_reaction(
            session_id,
            json!({
                "trigger": event.event_type.as_str(),
                "action": reaction.action,
                "attempts": attempts,
                "maxRetries": reaction.max_retries,
                "session_id": session_id,
            }),
        )
        .await;
    }

    async fn respawn(&self, session_id: &str, event: &PipelineEvent, reaction: &ReactionConfig) {
        let session = match self.sessions.load(session_id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        let prompt = interpolate(
            reaction.prompt.as_deref().unwrap_or("Investigate and fix the reported failure."),
            &session,
            &event.data,
        );
        let agent_cfg = &self.config.agents.conflict;
        let spec = ProcessSpec {
            prompt,
            model: agent_cfg.model.clone(),
            permission_mode: agent_cfg.permission_mode.clone(),
            max_turns: agent_cfg.max_turns,
            cwd: session
                .worktree_path
                .clone()
                .unwrap_or_else(|| self.project_path.clone()),
            cancel: None,
        };
        let agent = Arc::clone(&self.agent);
        let breaker = self.breakers.claude.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            let outcome =
                guarded(breaker.as_deref(), move || async move { agent.run(spec).await }).await;
            match outcome {
                Ok(out) if out.success => info!(session_id = %id, "respawned agent finished"),
                Ok(_) => warn!(session_id = %id, "respawned agent reported failure"),
                Err(e) => warn!(session_id = %id, "respawned agent: {e:#}"),
            }
        });
    }

    async fn on_ci_passed(self: &Arc<Self>, session_id: &str, event: &PipelineEvent) {
        self.ensure_session(session_id, &event.data).await;
        let approved = event
            .data
            .get("prApproved")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || matches!(
                self.sessions.load(session_id).await,
                Ok(Some(Session { approved: true, .. }))
            );
        let auto_merge = self
            .config
            .reactions
            .approved_and_green
            .as_ref()
            .is_some_and(|r| r.action == ReactionAction::AutoMerge);
        if !(approved && auto_merge) {
            // A session created at pr_created reaches review_pending via
            // ci_running; both transitions are attempted, invalid ones are
            // rejected by the machine and logged.
            self.sessions.transition(session_id, SessionStatus::CiRunning).await.ok();
            if let Err(e) =
                self.sessions.transition(session_id, SessionStatus::ReviewPending).await
            {
                warn!(session_id = %session_id, "mark review_pending: {e:#}");
            }
            return;
        }

        let session = match self.sessions.load(session_id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        let Some(branch) = session.branch.clone() else {
            warn!(session_id = %session_id, "approved and green but no branch recorded");
            return;
        };
        info!(session_id = %session_id, "approved and green, merging {branch}");
        let gh = Gh::new(&self.project_path);
        let merged = guarded(self.breakers.github.as_deref(), || async {
            gh.pr_merge_squash(&branch).await
        })
        .await;
        if let Err(e) = merged {
            warn!(session_id = %session_id, "auto-merge of {branch}: {e:#}");
            return;
        }
        self.emit_reaction(
            session_id,
            json!({
                "trigger": event.event_type.as_str(),
                "action": "auto_merge",
                "session_id": session_id,
                "branch": branch,
            }),
        )
        .await;
    }

    async fn escalate(
        &self,
        session_id: &str,
        trigger: PipelineEventType,
        attempts: u32,
        max_retries: u32,
        reason: &str,
    ) {
        warn!(session_id = %session_id, "escalating: {reason}");
        if let Err(e) = self.sessions.transition(session_id, SessionStatus::Escalated).await {
            warn!(session_id = %session_id, "mark escalated: {e:#}");
        }
        self.bus
            .publish(PipelineEvent::new(
                PipelineEventType::SessionTransition,
                session_id,
                json!({"session_id": session_id, "to": "escalated", "reason": reason}),
            ))
            .await;
        self.emit_reaction(
            session_id,
            json!({
                "trigger": trigger.as_str(),
                "action": "notify",
                "attempts": attempts,
                "maxRetries": max_retries,
                "session_id": session_id,
                "message": reason,
            }),
        )
        .await;
    }

    // ── Stuck timers ──────────────────────────────────────────────────────

    fn arm_stuck_timer(self: &Arc<Self>, session_id: &str) {
        let Some(stuck) = self.config.reactions.agent_stuck.clone() else { return };
        let token = CancellationToken::new();
        {
            let mut timers = match self.stuck_timers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(old) = timers.insert(session_id.to_string(), token.clone()) {
                old.cancel();
            }
        }

        let this = Arc::clone(self);
        let id = session_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(stuck.after_min * 60)) => {}
            }
            let still_active = matches!(
                this.sessions.load(&id).await,
                Ok(Some(Session { is_active: true, .. }))
            );
            if !still_active {
                return;
            }
            let reason = stuck
                .message
                .clone()
                .unwrap_or_else(|| format!("agent stuck for {} min", stuck.after_min));
            match stuck.action {
                ReactionAction::Escalate => {
                    this.escalate(&id, PipelineEventType::SessionImplementing, 0, 0, &reason)
                        .await;
                }
                _ => {
                    this.emit_reaction(
                        &id,
                        json!({
                            "trigger": "agent_stuck",
                            "action": "notify",
                            "session_id": id,
                            "message": reason,
                        }),
                    )
                    .await;
                }
            }
        });
    }

    fn clear_stuck_timer(&self, session_id: &str) {
        let mut timers = match self.stuck_timers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(token) = timers.remove(session_id) {
            token.cancel();
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    async fn ensure_session(&self, session_id: &str, data: &Value) {
        let issue = data.get("issueNumber").and_then(Value::as_u64);
        let pr = data.get("prNumber").and_then(Value::as_u64);
        let branch = data.get("branch").and_then(Value::as_str);
        if let Err(e) = self.sessions.get_or_create(session_id, issue, pr, branch).await {
            warn!(session_id = %session_id, "get_or_create session: {e:#}");
        }
    }

    async fn emit_reaction(&self, session_id: &str, data: Value) {
        self.bus
            .publish(PipelineEvent::new(PipelineEventType::ReactionTriggered, session_id, data))
            .await;
    }
}

/// The bus routing key doubles as the session id; `data.session_id` wins
/// when present.
fn session_id_of(event: &PipelineEvent) -> String {
    event
        .data
        .get("session_id")
        .and_then(Value::as_str)
        .unwrap_or(&event.request_id)
        .to_string()
}

fn interpolate(template: &str, session: &Session, data: &Value) -> String {
    let issue = data
        .get("issueNumber")
        .and_then(Value::as_u64)
        .unwrap_or(session.issue.number);
    let pr = data
        .get("prNumber")
        .and_then(Value::as_u64)
        .or(session.pr_number)
        .unwrap_or(0);
    template
        .replace("#{issueNumber}", &issue.to_string())
        .replace("#{prNumber}", &pr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueRef, SessionAttempts};

    fn session() -> Session {
        Session {
            id: "s1".into(),
            issue: IssueRef { number: 7 },
            pr_number: Some(42),
            status: SessionStatus::CiRunning,
            stage: "ci_running".into(),
            attempts: SessionAttempts::default(),
            approved: false,
            is_active: true,
            is_terminal: false,
            branch: Some("issue/7".into()),
            worktree_path: None,
        }
    }

    #[test]
    fn prompt_interpolation_uses_event_then_session() {
        let s = session();
        let out = interpolate(
            "Fix CI on issue #{issueNumber}, PR #{prNumber}",
            &s,
            &json!({"prNumber": 99}),
        );
        assert_eq!(out, "Fix CI on issue 7, PR 99");
    }

    #[test]
    fn session_id_prefers_data_field() {
        let event = PipelineEvent::new(
            PipelineEventType::SessionCiFailed,
            "routing-key",
            json!({"session_id": "s42"}),
        );
        assert_eq!(session_id_of(&event), "s42");
    }
}
