use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{AgentResult, AgentRole, DiffStats};

/// Everything a quality agent needs to examine one changed worktree.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub request_id: String,
    pub branch: String,
    pub worktree_path: String,
    pub diff: DiffStats,
    pub cancel: CancellationToken,
}

/// Drives one quality agent to a structured verdict. Implemented by the
/// chat-loop executor in the agent crate; tests substitute fakes.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn run_agent(&self, role: &AgentRole, ctx: AgentContext) -> Result<AgentResult>;
}

/// Launch parameters for an opaque CLI agent subprocess (conflict
/// resolution, reaction respawns). The subprocess protocol itself is not
/// this system's concern.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub prompt: String,
    pub model: String,
    pub permission_mode: String,
    pub max_turns: u32,
    pub cwd: String,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub success: bool,
    pub output: String,
    pub session_id: Option<String>,
    pub duration_ms: u64,
}

/// An LLM agent run as a subprocess, treated as an opaque capability.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    async fn run(&self, spec: ProcessSpec) -> Result<ProcessOutcome>;
}
