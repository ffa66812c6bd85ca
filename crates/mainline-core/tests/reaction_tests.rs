use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mainline_core::agent::{AgentProcess, ProcessOutcome, ProcessSpec};
use mainline_core::bus::EventBus;
use mainline_core::circuit::BreakerSet;
use mainline_core::config::{Config, ReactionAction, ReactionConfig};
use mainline_core::reactions::ReactionEngine;
use mainline_core::sessions::SessionStore;
use mainline_core::types::{PipelineEvent, PipelineEventType, SessionStatus};
use serde_json::json;

struct FakeProcess {
    prompts: Mutex<Vec<String>>,
}

impl FakeProcess {
    fn new() -> Arc<Self> {
        Arc::new(Self { prompts: Mutex::new(Vec::new()) })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl AgentProcess for FakeProcess {
    async fn run(&self, spec: ProcessSpec) -> Result<ProcessOutcome> {
        self.prompts.lock().expect("prompts lock").push(spec.prompt);
        Ok(ProcessOutcome { success: true, output: "done".into(), session_id: None, duration_ms: 1 })
    }
}

struct Rig {
    bus: Arc<EventBus>,
    sessions: Arc<SessionStore>,
    engine: Arc<ReactionEngine>,
    process: Arc<FakeProcess>,
    _dir: tempfile::TempDir,
}

fn rig(mut config: Config) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    config.project_path = dir.path().to_string_lossy().into_owned();
    let config = Arc::new(config);
    let bus = Arc::new(EventBus::new(dir.path().join("events")));
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));
    let process = FakeProcess::new();
    let engine = ReactionEngine::new(
        Arc::clone(&config),
        Arc::clone(&bus),
        Arc::clone(&sessions),
        Arc::clone(&process) as Arc<dyn AgentProcess>,
        Arc::new(BreakerSet::default()),
        config.project_path.clone(),
    );
    Rig { bus, sessions, engine, process, _dir: dir }
}

fn ci_failed(session_id: &str) -> PipelineEvent {
    PipelineEvent::new(
        PipelineEventType::SessionCiFailed,
        session_id,
        json!({
            "session_id": session_id,
            "branch": "issue/7-fix",
            "sha": "deadbeef",
            "issueNumber": 7,
            "prNumber": 42,
        }),
    )
}

fn respawn_config(max_retries: u32) -> Config {
    let mut config = Config::default();
    config.reactions.ci_failed = Some(ReactionConfig {
        action: ReactionAction::RespawnAgent,
        max_retries,
        prompt: Some("Fix CI for issue #{issueNumber}, PR #{prNumber}".into()),
        message: None,
    });
    config
}

// ── Respawn then escalate (retry budget) ─────────────────────────────────

#[tokio::test]
async fn ci_failures_respawn_until_the_budget_then_escalate() {
    let r = rig(respawn_config(2));

    for _ in 0..3 {
        r.engine.handle(&ci_failed("s1")).await;
    }
    // Respawns run on spawned tasks; give them a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let prompts = r.process.prompts();
    assert_eq!(prompts.len(), 2, "two respawns, no third after the budget");
    assert_eq!(prompts[0], "Fix CI for issue 7, PR 42");

    let events = r.bus.events_for("s1").await.expect("events");
    let reactions: Vec<&PipelineEvent> = events
        .iter()
        .filter(|e| e.event_type == PipelineEventType::ReactionTriggered)
        .collect();
    assert_eq!(reactions.len(), 3);
    assert_eq!(reactions[0].data["action"], "respawn_agent");
    assert_eq!(reactions[0].data["attempts"], 1);
    assert_eq!(reactions[1].data["attempts"], 2);
    assert_eq!(reactions[2].data["action"], "notify");
    assert_eq!(
        reactions[2].data["message"],
        "CI failed 3 times — exceeded retry budget",
    );

    let transition = events
        .iter()
        .find(|e| e.event_type == PipelineEventType::SessionTransition)
        .expect("session.transition emitted");
    assert_eq!(transition.data["to"], "escalated");

    let session = r.sessions.load("s1").await.expect("load").expect("session exists");
    assert_eq!(session.status, SessionStatus::Escalated);
    assert!(session.is_terminal);
    assert_eq!(session.attempts.ci, 3);
}

#[tokio::test]
async fn escalation_fires_exactly_at_budget_plus_one() {
    let r = rig(respawn_config(1));

    r.engine.handle(&ci_failed("s2")).await;
    r.engine.handle(&ci_failed("s2")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(r.process.prompts().len(), 1);
    let session = r.sessions.load("s2").await.expect("load").expect("session");
    assert_eq!(session.status, SessionStatus::Escalated);

    // Further failures keep escalating state, never respawn again.
    r.engine.handle(&ci_failed("s2")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(r.process.prompts().len(), 1);
}

// ── Review feedback uses its own counter ─────────────────────────────────

#[tokio::test]
async fn review_attempts_are_tracked_separately_from_ci() {
    let mut config = respawn_config(2);
    config.reactions.changes_requested = Some(ReactionConfig {
        action: ReactionAction::RespawnAgent,
        max_retries: 2,
        prompt: Some("Address review on PR #{prNumber}".into()),
        message: None,
    });
    let r = rig(config);

    r.engine.handle(&ci_failed("s3")).await;
    let changes = PipelineEvent::new(
        PipelineEventType::SessionChangesRequested,
        "s3",
        json!({"session_id": "s3", "branch": "issue/7-fix", "prNumber": 42, "issueNumber": 7}),
    );
    r.engine.handle(&changes).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let session = r.sessions.load("s3").await.expect("load").expect("session");
    assert_eq!(session.attempts.ci, 1);
    assert_eq!(session.attempts.review, 1);
    assert_eq!(session.status, SessionStatus::PrCreated, "no escalation yet");
}

// ── No reactor configured ────────────────────────────────────────────────

#[tokio::test]
async fn unconfigured_trigger_is_inert() {
    let r = rig(Config::default());
    r.engine.handle(&ci_failed("s4")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(r.process.prompts().is_empty());
    let events = r.bus.events_for("s4").await.expect("events");
    assert!(events.is_empty(), "nothing published without a configured reaction");
}

// ── Stuck timer ──────────────────────────────────────────────────────────

#[tokio::test]
async fn merged_session_clears_its_stuck_timer() {
    let mut config = Config::default();
    config.reactions.agent_stuck = Some(mainline_core::config::StuckReactionConfig {
        after_min: 1,
        action: ReactionAction::Notify,
        message: Some("agent looks stuck".into()),
    });
    let r = rig(config);

    // pr_created arms the timer; merged clears it before it can fire.
    let pr_created = PipelineEvent::new(
        PipelineEventType::SessionPrCreated,
        "s5",
        json!({"session_id": "s5", "branch": "issue/9", "prNumber": 9}),
    );
    r.sessions.get_or_create("s5", Some(9), Some(9), Some("issue/9")).await.expect("session");
    r.engine.handle(&pr_created).await;

    let merged = PipelineEvent::new(
        PipelineEventType::SessionMerged,
        "s5",
        json!({"session_id": "s5"}),
    );
    r.engine.handle(&merged).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = r.bus.events_for("s5").await.expect("events");
    assert!(
        events.iter().all(|e| e.event_type != PipelineEventType::ReactionTriggered),
        "cleared timer must not notify",
    );
}
