use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Tier / status enums ──────────────────────────────────────────────────

/// Size bucket controlling which quality agents run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Pipeline run status. Terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Accepted,
    Running,
    Correcting,
    Approved,
    Failed,
    Error,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Failed | Self::Error)
    }
}

/// Manifest container a branch currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStage {
    Running,
    Ready,
    PendingMerge,
    MergeHistory,
    Removed,
}

/// Reactive-workflow session status (subset driven by webhook events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Implementing,
    PrCreated,
    CiRunning,
    ReviewPending,
    Failed,
    Escalated,
    Merged,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Escalated)
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// Every event type the bus routes. The wire names are dotted, matching the
/// JSONL forensic logs and outbound webhook payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineEventType {
    #[serde(rename = "pipeline.accepted")]
    PipelineAccepted,
    #[serde(rename = "pipeline.tier_classified")]
    PipelineTierClassified,
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    #[serde(rename = "pipeline.stopped")]
    PipelineStopped,
    #[serde(rename = "pipeline.error")]
    PipelineError,
    #[serde(rename = "integration.started")]
    IntegrationStarted,
    #[serde(rename = "integration.conflict.detected")]
    IntegrationConflictDetected,
    #[serde(rename = "integration.conflict.resolved")]
    IntegrationConflictResolved,
    #[serde(rename = "integration.pr.created")]
    IntegrationPrCreated,
    #[serde(rename = "integration.failed")]
    IntegrationFailed,
    #[serde(rename = "integration.pr.rebased")]
    IntegrationPrRebased,
    #[serde(rename = "integration.pr.rebase_failed")]
    IntegrationPrRebaseFailed,
    #[serde(rename = "integration.pr.merged")]
    IntegrationPrMerged,
    #[serde(rename = "session.review_requested")]
    SessionReviewRequested,
    #[serde(rename = "session.changes_requested")]
    SessionChangesRequested,
    #[serde(rename = "session.ci_passed")]
    SessionCiPassed,
    #[serde(rename = "session.ci_failed")]
    SessionCiFailed,
    #[serde(rename = "session.implementing")]
    SessionImplementing,
    #[serde(rename = "session.pr_created")]
    SessionPrCreated,
    #[serde(rename = "session.merged")]
    SessionMerged,
    #[serde(rename = "session.failed")]
    SessionFailed,
    #[serde(rename = "session.escalated")]
    SessionEscalated,
    #[serde(rename = "session.transition")]
    SessionTransition,
    #[serde(rename = "pr.approved")]
    PrApproved,
    #[serde(rename = "reaction.triggered")]
    ReactionTriggered,
}

impl PipelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineAccepted => "pipeline.accepted",
            Self::PipelineTierClassified => "pipeline.tier_classified",
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
            Self::PipelineStopped => "pipeline.stopped",
            Self::PipelineError => "pipeline.error",
            Self::IntegrationStarted => "integration.started",
            Self::IntegrationConflictDetected => "integration.conflict.detected",
            Self::IntegrationConflictResolved => "integration.conflict.resolved",
            Self::IntegrationPrCreated => "integration.pr.created",
            Self::IntegrationFailed => "integration.failed",
            Self::IntegrationPrRebased => "integration.pr.rebased",
            Self::IntegrationPrRebaseFailed => "integration.pr.rebase_failed",
            Self::IntegrationPrMerged => "integration.pr.merged",
            Self::SessionReviewRequested => "session.review_requested",
            Self::SessionChangesRequested => "session.changes_requested",
            Self::SessionCiPassed => "session.ci_passed",
            Self::SessionCiFailed => "session.ci_failed",
            Self::SessionImplementing => "session.implementing",
            Self::SessionPrCreated => "session.pr_created",
            Self::SessionMerged => "session.merged",
            Self::SessionFailed => "session.failed",
            Self::SessionEscalated => "session.escalated",
            Self::SessionTransition => "session.transition",
            Self::PrApproved => "pr.approved",
            Self::ReactionTriggered => "reaction.triggered",
        }
    }
}

impl std::fmt::Display for PipelineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, routable event. One line in the request's JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: PipelineEventType,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PipelineEvent {
    pub fn new(event_type: PipelineEventType, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            request_id: request_id.into(),
            timestamp: Utc::now(),
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── Pipeline request / state ─────────────────────────────────────────────

/// Per-request overrides supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default)]
    pub tier: Option<Tier>,
    /// Explicit agent list; overrides the tier's defaults.
    #[serde(default)]
    pub agents: Option<Vec<String>>,
    /// When true the completed run is not handed to the integrator.
    #[serde(default)]
    pub skip_merge: bool,
}

/// An accepted pipeline request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(default)]
    pub request_id: String,
    pub branch: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    pub worktree_path: String,
    #[serde(default, alias = "projectId")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub config: Option<RequestConfig>,
}

/// Mutable run state, owned by the runner, pruned after terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub request_id: String,
    pub branch: String,
    pub status: PipelineStatus,
    pub tier: Option<Tier>,
    pub pipeline_branch: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub events_count: u64,
    pub corrections_count: u32,
    pub corrections_applied: Vec<String>,
}

/// Diff summary gathered from version control before agent fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub changed_files: Vec<String>,
}

impl DiffStats {
    pub fn total_lines(&self) -> u64 {
        self.lines_added + self.lines_deleted
    }
}

// ── Quality agents ───────────────────────────────────────────────────────

/// Configuration for one quality agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRole {
    pub name: String,
    pub system_prompt: String,
    pub model: String,
    pub provider: String,
    pub tools: Vec<String>,
    pub max_turns: u32,
    #[serde(default)]
    pub context_docs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Passed,
    Failed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A single issue reported by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    pub description: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub fix_applied: bool,
    #[serde(default)]
    pub fix_description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRunMetadata {
    pub duration_ms: u64,
    pub turns_used: u32,
    pub tokens_used: TokenUsage,
    pub model: String,
    pub provider: String,
}

/// Structured outcome of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: String,
    pub status: AgentStatus,
    pub findings: Vec<Finding>,
    pub fixes_applied: u32,
    pub metadata: AgentRunMetadata,
}

impl AgentResult {
    /// True when the agent failed but left applied fixes to re-verify.
    pub fn has_applied_fixes(&self) -> bool {
        self.findings.iter().any(|f| f.fix_applied)
    }
}

// ── Manifest ─────────────────────────────────────────────────────────────

fn default_priority() -> u32 {
    10
}

/// A branch that finished its pipeline and awaits integration.
/// `priority` is an ordinal where lower = more urgent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestReadyEntry {
    pub branch: String,
    pub pipeline_branch: String,
    pub worktree_path: String,
    pub request_id: String,
    #[serde(default)]
    pub tier: Option<Tier>,
    pub pipeline_result: Value,
    #[serde(default)]
    pub corrections_applied: Vec<String>,
    pub ready_at: DateTime<Utc>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Branches that must already be in merge_history before this entry
    /// becomes eligible.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    /// origin/<main> sha observed when the entry was written; the director
    /// uses it for drift detection.
    pub base_main_sha: String,
    #[serde(default)]
    pub skip_merge: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// A ready entry after PR creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPendingMergeEntry {
    #[serde(flatten)]
    pub entry: ManifestReadyEntry,
    pub integration_branch: String,
    pub pr_number: u64,
    pub pr_url: String,
    pub conflicts_resolved: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeHistoryEntry {
    pub branch: String,
    pub pr_number: u64,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    pub merged_at: DateTime<Utc>,
}

/// The persisted manifest document. Each branch occupies exactly one
/// container at any time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub ready: Vec<ManifestReadyEntry>,
    #[serde(default)]
    pub pending_merge: Vec<ManifestPendingMergeEntry>,
    #[serde(default)]
    pub merge_history: Vec<MergeHistoryEntry>,
}

impl Manifest {
    /// The container currently holding `branch`, if any.
    pub fn container_of(&self, branch: &str) -> Option<BranchStage> {
        if self.ready.iter().any(|e| e.branch == branch) {
            return Some(BranchStage::Ready);
        }
        if self.pending_merge.iter().any(|e| e.entry.branch == branch) {
            return Some(BranchStage::PendingMerge);
        }
        if self.merge_history.iter().any(|e| e.branch == branch) {
            return Some(BranchStage::MergeHistory);
        }
        None
    }

    pub fn in_merge_history(&self, branch: &str) -> bool {
        self.merge_history.iter().any(|e| e.branch == branch)
    }
}

// ── Integrator results ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegratorResult {
    pub success: bool,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub integration_branch: Option<String>,
    #[serde(default)]
    pub base_main_sha: Option<String>,
    #[serde(default)]
    pub conflicts_resolved: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebaseResult {
    pub success: bool,
    #[serde(default)]
    pub conflicts_resolved: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Sessions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionAttempts {
    pub ci: u32,
    pub review: u32,
}

/// On-disk record for a reactive workflow session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub issue: IssueRef,
    #[serde(default)]
    pub pr_number: Option<u64>,
    pub status: SessionStatus,
    pub stage: String,
    pub attempts: SessionAttempts,
    /// Latest review verdict; set by an approved review, cleared by a
    /// changes-requested one.
    #[serde(default)]
    pub approved: bool,
    pub is_active: bool,
    pub is_terminal: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
}

// ── Saga log ─────────────────────────────────────────────────────────────

/// Persisted journal of one saga execution, written before and after every
/// step so a crash leaves a reconstructable trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaLog {
    pub saga_name: String,
    pub request_id: String,
    pub steps_completed: Vec<String>,
    #[serde(default)]
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at_step: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensations_run: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}
