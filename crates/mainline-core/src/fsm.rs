use std::fmt::Debug;

use tracing::warn;

use crate::types::{BranchStage, PipelineStatus, SessionStatus};

/// A transition-map state machine. States with no outgoing edges are sinks.
///
/// Invalid transitions are logged and rejected; the holder keeps its prior
/// state and continues.
pub struct StateMachine<S: 'static + Copy + Eq + Debug> {
    current: S,
    table: &'static [(S, &'static [S])],
}

impl<S: 'static + Copy + Eq + Debug> StateMachine<S> {
    pub fn new(initial: S, table: &'static [(S, &'static [S])]) -> Self {
        Self { current: initial, table }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn can(&self, to: S) -> bool {
        self.table
            .iter()
            .find(|(from, _)| *from == self.current)
            .map(|(_, targets)| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Attempt a transition. Returns false (and logs) when the edge is not
    /// in the table; the current state is left unchanged.
    pub fn transition(&mut self, to: S) -> bool {
        if self.can(to) {
            self.current = to;
            true
        } else {
            warn!("invalid transition {:?} -> {:?} rejected", self.current, to);
            false
        }
    }
}

// ── Transition tables ────────────────────────────────────────────────────

/// accepted → running → {correcting, approved, failed, error};
/// correcting → {running, approved, failed, error}. Terminal states sink.
pub const PIPELINE_TRANSITIONS: &[(PipelineStatus, &[PipelineStatus])] = &[
    (PipelineStatus::Accepted, &[PipelineStatus::Running]),
    (
        PipelineStatus::Running,
        &[
            PipelineStatus::Correcting,
            PipelineStatus::Approved,
            PipelineStatus::Failed,
            PipelineStatus::Error,
        ],
    ),
    (
        PipelineStatus::Correcting,
        &[
            PipelineStatus::Running,
            PipelineStatus::Approved,
            PipelineStatus::Failed,
            PipelineStatus::Error,
        ],
    ),
];

/// running → {ready, removed}; ready → pending_merge;
/// pending_merge → {ready (rollback), merge_history}. A rebase keeps the
/// entry in pending_merge and is not a transition.
pub const BRANCH_TRANSITIONS: &[(BranchStage, &[BranchStage])] = &[
    (BranchStage::Running, &[BranchStage::Ready, BranchStage::Removed]),
    (BranchStage::Ready, &[BranchStage::PendingMerge]),
    (BranchStage::PendingMerge, &[BranchStage::Ready, BranchStage::MergeHistory]),
];

pub const SESSION_TRANSITIONS: &[(SessionStatus, &[SessionStatus])] = &[
    (SessionStatus::Planning, &[SessionStatus::Implementing]),
    (
        SessionStatus::Implementing,
        &[SessionStatus::PrCreated, SessionStatus::Failed, SessionStatus::Escalated],
    ),
    (
        SessionStatus::PrCreated,
        &[SessionStatus::CiRunning, SessionStatus::Failed, SessionStatus::Escalated],
    ),
    (
        SessionStatus::CiRunning,
        &[
            SessionStatus::ReviewPending,
            SessionStatus::Merged,
            SessionStatus::Failed,
            SessionStatus::Escalated,
        ],
    ),
    (
        SessionStatus::ReviewPending,
        &[
            SessionStatus::Implementing,
            SessionStatus::CiRunning,
            SessionStatus::Merged,
            SessionStatus::Failed,
            SessionStatus::Escalated,
        ],
    ),
];

pub fn pipeline_machine() -> StateMachine<PipelineStatus> {
    StateMachine::new(PipelineStatus::Accepted, PIPELINE_TRANSITIONS)
}

pub fn branch_machine() -> StateMachine<BranchStage> {
    StateMachine::new(BranchStage::Running, BRANCH_TRANSITIONS)
}

pub fn session_machine(initial: SessionStatus) -> StateMachine<SessionStatus> {
    StateMachine::new(initial, SESSION_TRANSITIONS)
}
