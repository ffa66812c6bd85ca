use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::types::SagaLog;

/// A forward step with an optional compensating action.
///
/// Steps are plain functions over a mutable context so a saga can be
/// declared as a const-like table and executed generically.
pub struct SagaStep<C> {
    pub name: &'static str,
    pub run: for<'a> fn(&'a mut C) -> BoxFuture<'a, Result<()>>,
    pub compensate: Option<for<'a> fn(&'a mut C) -> BoxFuture<'a, Result<()>>>,
}

/// Persisted journal of one saga execution.
///
/// The log file under `sagas/{request_id}.json` is rewritten before and
/// after every step so a crash at any point leaves a reconstructable trail.
pub struct SagaJournal {
    path: PathBuf,
    pub log: SagaLog,
}

impl SagaJournal {
    pub async fn begin(
        dir: impl Into<PathBuf>,
        saga_name: &str,
        request_id: &str,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
        let journal = Self {
            path: dir.join(format!("{}.json", sanitize(request_id))),
            log: SagaLog {
                saga_name: saga_name.to_string(),
                request_id: request_id.to_string(),
                steps_completed: Vec::new(),
                current_step: None,
                started_at: Utc::now(),
                completed_at: None,
                failed_at_step: None,
                compensations_run: Vec::new(),
                error: None,
            },
        };
        journal.persist().await;
        Ok(journal)
    }

    async fn step_started(&mut self, name: &str) {
        self.log.current_step = Some(name.to_string());
        self.persist().await;
    }

    async fn step_completed(&mut self, name: &str) {
        self.log.current_step = None;
        self.log.steps_completed.push(name.to_string());
        self.persist().await;
    }

    async fn record_failure(&mut self, step: &str, error: &str) {
        self.log.failed_at_step = Some(step.to_string());
        self.log.error = Some(error.to_string());
        self.persist().await;
    }

    async fn record_compensation(&mut self, name: &str, ok: bool) {
        let entry = if ok { name.to_string() } else { format!("{name} (FAILED)") };
        self.log.compensations_run.push(entry);
        self.persist().await;
    }

    async fn finish(&mut self) {
        self.log.current_step = None;
        self.log.completed_at = Some(Utc::now());
        self.persist().await;
    }

    /// Journal writes are forensic; a failure is logged, never fatal.
    async fn persist(&self) {
        let json = match serde_json::to_string_pretty(&self.log) {
            Ok(json) => json,
            Err(e) => {
                error!("serialize saga log {}: {e}", self.log.request_id);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            error!("write saga log {}: {e}", self.path.display());
        }
    }
}

/// Run the steps in order; on failure (or cancellation between steps) run
/// the compensations of every completed step in reverse order. A failing
/// compensation is recorded as `<name> (FAILED)` and the sweep continues.
pub async fn run_saga<C>(
    journal: &mut SagaJournal,
    steps: &[SagaStep<C>],
    ctx: &mut C,
    cancel: Option<&CancellationToken>,
) -> Result<()> {
    let mut completed: Vec<usize> = Vec::new();
    for (idx, step) in steps.iter().enumerate() {
        if cancel.is_some_and(|t| t.is_cancelled()) {
            let err = anyhow!("saga '{}' cancelled before step {}", journal.log.saga_name, step.name);
            journal.record_failure(step.name, &err.to_string()).await;
            compensate(journal, steps, ctx, &completed).await;
            return Err(err);
        }
        journal.step_started(step.name).await;
        match (step.run)(ctx).await {
            Ok(()) => {
                journal.step_completed(step.name).await;
                completed.push(idx);
            }
            Err(e) => {
                warn!("saga '{}' failed at {}: {e:#}", journal.log.saga_name, step.name);
                journal.record_failure(step.name, &format!("{e:#}")).await;
                compensate(journal, steps, ctx, &completed).await;
                return Err(e);
            }
        }
    }
    journal.finish().await;
    Ok(())
}

async fn compensate<C>(
    journal: &mut SagaJournal,
    steps: &[SagaStep<C>],
    ctx: &mut C,
    completed: &[usize],
) {
    for &idx in completed.iter().rev() {
        let step = &steps[idx];
        let Some(comp) = step.compensate else { continue };
        match comp(ctx).await {
            Ok(()) => {
                info!("saga '{}': compensated {}", journal.log.saga_name, step.name);
                journal.record_compensation(step.name, true).await;
            }
            Err(e) => {
                error!("saga '{}': compensation {} failed: {e:#}", journal.log.saga_name, step.name);
                journal.record_compensation(step.name, false).await;
            }
        }
    }
}

/// Count sagas whose last persisted state is mid-step (crash evidence).
/// They are flagged at startup, never auto-resumed.
pub async fn incomplete_sagas(dir: &PathBuf) -> Vec<SagaLog> {
    let mut flagged = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return flagged;
    };
    while let Ok(Some(dirent)) = entries.next_entry().await {
        let path = dirent.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(contents) = tokio::fs::read_to_string(&path).await else { continue };
        let Ok(log) = serde_json::from_str::<SagaLog>(&contents) else { continue };
        if log.current_step.is_some() && log.completed_at.is_none() {
            flagged.push(log);
        }
    }
    flagged
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}
