use anyhow::{bail, Result};
use futures::future::BoxFuture;
use mainline_core::saga::{incomplete_sagas, run_saga, SagaJournal, SagaStep};
use mainline_core::types::SagaLog;

/// Toy saga context: records every forward and compensating action, and
/// fails on command.
#[derive(Default)]
struct Trace {
    actions: Vec<String>,
    fail_at: Option<&'static str>,
    fail_compensation: Option<&'static str>,
}

fn forward(name: &'static str) -> for<'a> fn(&'a mut Trace) -> BoxFuture<'a, Result<()>> {
    match name {
        "one" => |t| Box::pin(run_step(t, "one")),
        "two" => |t| Box::pin(run_step(t, "two")),
        "three" => |t| Box::pin(run_step(t, "three")),
        _ => unreachable!(),
    }
}

async fn run_step(trace: &mut Trace, name: &'static str) -> Result<()> {
    if trace.fail_at == Some(name) {
        bail!("step {name} exploded");
    }
    trace.actions.push(format!("run:{name}"));
    Ok(())
}

async fn run_comp(trace: &mut Trace, name: &'static str) -> Result<()> {
    if trace.fail_compensation == Some(name) {
        bail!("compensation {name} exploded");
    }
    trace.actions.push(format!("comp:{name}"));
    Ok(())
}

fn steps() -> [SagaStep<Trace>; 3] {
    [
        SagaStep {
            name: "one",
            run: forward("one"),
            compensate: Some(|t| Box::pin(run_comp(t, "one"))),
        },
        SagaStep {
            name: "two",
            run: forward("two"),
            compensate: Some(|t| Box::pin(run_comp(t, "two"))),
        },
        SagaStep { name: "three", run: forward("three"), compensate: None },
    ]
}

async fn journal(dir: &std::path::Path, request_id: &str) -> SagaJournal {
    SagaJournal::begin(dir, "test-saga", request_id).await.expect("begin journal")
}

fn read_log(dir: &std::path::Path, request_id: &str) -> SagaLog {
    let path = dir.join(format!("{request_id}.json"));
    let contents = std::fs::read_to_string(path).expect("read saga log");
    serde_json::from_str(&contents).expect("parse saga log")
}

// ── Happy path ───────────────────────────────────────────────────────────

#[tokio::test]
async fn all_steps_complete_and_journal_closes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut j = journal(dir.path(), "r1").await;
    let mut trace = Trace::default();

    run_saga(&mut j, &steps(), &mut trace, None).await.expect("saga");

    assert_eq!(trace.actions, vec!["run:one", "run:two", "run:three"]);
    let log = read_log(dir.path(), "r1");
    assert_eq!(log.steps_completed, vec!["one", "two", "three"]);
    assert!(log.completed_at.is_some());
    assert!(log.current_step.is_none());
    assert!(log.failed_at_step.is_none());
    assert!(log.compensations_run.is_empty());
}

// ── Compensation order ───────────────────────────────────────────────────

#[tokio::test]
async fn failure_compensates_completed_steps_in_reverse() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut j = journal(dir.path(), "r2").await;
    let mut trace = Trace { fail_at: Some("three"), ..Default::default() };

    let result = run_saga(&mut j, &steps(), &mut trace, None).await;
    assert!(result.is_err());

    // Steps one and two ran; compensations run two first, then one.
    assert_eq!(trace.actions, vec!["run:one", "run:two", "comp:two", "comp:one"]);
    let log = read_log(dir.path(), "r2");
    assert_eq!(log.failed_at_step.as_deref(), Some("three"));
    assert_eq!(log.compensations_run, vec!["two", "one"]);
    assert!(log.completed_at.is_none());
    assert!(log.error.as_deref().is_some_and(|e| e.contains("exploded")));
}

#[tokio::test]
async fn no_compensation_for_steps_that_never_ran() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut j = journal(dir.path(), "r3").await;
    let mut trace = Trace { fail_at: Some("one"), ..Default::default() };

    let result = run_saga(&mut j, &steps(), &mut trace, None).await;
    assert!(result.is_err());
    assert!(trace.actions.is_empty(), "nothing completed, nothing compensated");

    let log = read_log(dir.path(), "r3");
    assert!(log.steps_completed.is_empty());
    assert!(log.compensations_run.is_empty());
}

#[tokio::test]
async fn failed_compensation_is_recorded_and_sweep_continues() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut j = journal(dir.path(), "r4").await;
    let mut trace = Trace {
        fail_at: Some("three"),
        fail_compensation: Some("two"),
        ..Default::default()
    };

    let result = run_saga(&mut j, &steps(), &mut trace, None).await;
    assert!(result.is_err());

    // Compensation two fails but the sweep still reaches one.
    assert_eq!(trace.actions, vec!["run:one", "run:two", "comp:one"]);
    let log = read_log(dir.path(), "r4");
    assert_eq!(log.compensations_run, vec!["two (FAILED)", "one"]);
}

// ── Cancellation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_between_steps_compensates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut j = journal(dir.path(), "r5").await;
    let mut trace = Trace::default();

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let result = run_saga(&mut j, &steps(), &mut trace, Some(&cancel)).await;
    assert!(result.is_err());
    assert!(trace.actions.is_empty());
}

// ── Startup recovery ─────────────────────────────────────────────────────

#[tokio::test]
async fn mid_step_journals_are_flagged_as_incomplete() {
    let dir = tempfile::tempdir().expect("tempdir");

    // A clean run leaves nothing flagged.
    let mut j = journal(dir.path(), "clean").await;
    run_saga(&mut j, &steps(), &mut Trace::default(), None).await.expect("saga");

    // Simulate a crash mid-step by rewriting a journal with current_step set.
    let mut crashed = read_log(dir.path(), "clean");
    crashed.request_id = "crashed".into();
    crashed.current_step = Some("two".into());
    crashed.completed_at = None;
    std::fs::write(
        dir.path().join("crashed.json"),
        serde_json::to_string_pretty(&crashed).expect("serialize"),
    )
    .expect("write crashed journal");

    let flagged = incomplete_sagas(&dir.path().to_path_buf()).await;
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].request_id, "crashed");
}
