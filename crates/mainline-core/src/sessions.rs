use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::fsm::session_machine;
use crate::types::{IssueRef, Session, SessionAttempts, SessionStatus};

pub enum AttemptKind {
    Ci,
    Review,
}

/// On-disk session records under `.pipeline/sessions/`, one file per id.
///
/// Status changes go through the session state machine; an invalid
/// transition is logged, rejected, and leaves the record untouched.
pub struct SessionStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("create sessions dir {}: {e}", dir.display());
        }
        Self { dir, lock: Mutex::new(()) }
    }

    pub async fn load(&self, id: &str) -> Result<Option<Session>> {
        let _guard = self.lock.lock().await;
        self.read(id).await
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(session).await
    }

    /// Fetch a session, creating a fresh `pr_created` record when none
    /// exists (webhook-driven sessions first appear with an open PR).
    pub async fn get_or_create(
        &self,
        id: &str,
        issue_number: Option<u64>,
        pr_number: Option<u64>,
        branch: Option<&str>,
    ) -> Result<Session> {
        let _guard = self.lock.lock().await;
        if let Some(mut session) = self.read(id).await? {
            let mut dirty = false;
            if session.pr_number.is_none() && pr_number.is_some() {
                session.pr_number = pr_number;
                dirty = true;
            }
            if session.issue.number == 0 {
                if let Some(n) = issue_number {
                    session.issue.number = n;
                    dirty = true;
                }
            }
            if dirty {
                self.write(&session).await?;
            }
            return Ok(session);
        }
        let session = Session {
            id: id.to_string(),
            issue: IssueRef { number: issue_number.unwrap_or(0) },
            pr_number,
            status: SessionStatus::PrCreated,
            stage: "pr_created".into(),
            attempts: SessionAttempts::default(),
            approved: false,
            is_active: true,
            is_terminal: false,
            branch: branch.map(str::to_string),
            worktree_path: None,
        };
        self.write(&session).await?;
        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// Apply a status transition; returns the stored session either way.
    pub async fn transition(&self, id: &str, to: SessionStatus) -> Result<Session> {
        let _guard = self.lock.lock().await;
        let Some(mut session) = self.read(id).await? else {
            anyhow::bail!("session {id} not found");
        };
        let mut machine = session_machine(session.status);
        if machine.transition(to) {
            session.status = to;
            session.stage = stage_name(to).to_string();
            session.is_terminal = to.is_terminal();
            session.is_active = !session.is_terminal;
            self.write(&session).await?;
            info!(session_id = %id, "session -> {}", session.stage);
        }
        Ok(session)
    }

    pub async fn set_approved(&self, id: &str, approved: bool) -> Result<()> {
        let _guard = self.lock.lock().await;
        let Some(mut session) = self.read(id).await? else {
            anyhow::bail!("session {id} not found");
        };
        session.approved = approved;
        self.write(&session).await
    }

    pub async fn increment_attempt(&self, id: &str, kind: AttemptKind) -> Result<u32> {
        let _guard = self.lock.lock().await;
        let Some(mut session) = self.read(id).await? else {
            anyhow::bail!("session {id} not found");
        };
        let count = match kind {
            AttemptKind::Ci => {
                session.attempts.ci += 1;
                session.attempts.ci
            }
            AttemptKind::Review => {
                session.attempts.review += 1;
                session.attempts.review
            }
        };
        self.write(&session).await?;
        Ok(count)
    }

    async fn read(&self, id: &str) -> Result<Option<Session>> {
        let path = self.path_for(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .with_context(|| format!("parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn write(&self, session: &Session) -> Result<()> {
        let path = self.path_for(&session.id);
        let json = serde_json::to_string_pretty(session).context("serialize session")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

fn stage_name(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Planning => "planning",
        SessionStatus::Implementing => "implementing",
        SessionStatus::PrCreated => "pr_created",
        SessionStatus::CiRunning => "ci_running",
        SessionStatus::ReviewPending => "review_pending",
        SessionStatus::Failed => "failed",
        SessionStatus::Escalated => "escalated",
        SessionStatus::Merged => "merged",
    }
}
