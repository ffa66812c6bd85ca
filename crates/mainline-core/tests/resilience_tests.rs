use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mainline_core::circuit::CircuitBreaker;
use mainline_core::config::{CircuitBreakerConfig, DlqConfig};
use mainline_core::dlq::DeadLetterQueue;
use mainline_core::idempotency::{fingerprint, IdempotencyGuard};
use serde_json::json;

// ── Circuit breaker ──────────────────────────────────────────────────────

fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        "test",
        CircuitBreakerConfig { failure_threshold: threshold, reset_timeout_ms: reset_ms },
    )
}

async fn fail(b: &CircuitBreaker, calls: &AtomicU32) {
    let result: anyhow::Result<()> = b
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("boom")
        })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn breaker_opens_after_threshold_consecutive_failures() {
    let b = breaker(3, 60_000);
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        fail(&b, &calls).await;
    }
    assert_eq!(b.state_name(), "open");

    // While open, execute rejects without calling the wrapped function.
    let result: anyhow::Result<()> = b
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn success_resets_the_failure_count() {
    let b = breaker(3, 60_000);
    let calls = AtomicU32::new(0);

    fail(&b, &calls).await;
    fail(&b, &calls).await;
    let ok: anyhow::Result<()> = b.execute(|| async { Ok(()) }).await;
    assert!(ok.is_ok());
    fail(&b, &calls).await;
    fail(&b, &calls).await;
    assert_eq!(b.state_name(), "closed", "count restarted after success");
}

#[tokio::test]
async fn open_breaker_half_opens_after_reset_timeout() {
    let b = breaker(1, 30);
    let calls = AtomicU32::new(0);
    fail(&b, &calls).await;
    assert_eq!(b.state_name(), "open");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // First call after the timeout is admitted (half-open), success closes.
    let ok: anyhow::Result<()> = b.execute(|| async { Ok(()) }).await;
    assert!(ok.is_ok());
    assert_eq!(b.state_name(), "closed");
}

#[tokio::test]
async fn half_open_failure_reopens() {
    let b = breaker(1, 30);
    let calls = AtomicU32::new(0);
    fail(&b, &calls).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    fail(&b, &calls).await;
    assert_eq!(b.state_name(), "open");
}

// ── Idempotency guard ────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_claims_admit_exactly_one_caller() {
    let dir = tempfile::tempdir().expect("tempdir");
    let guard = Arc::new(
        IdempotencyGuard::load(dir.path().join("idempotency.json")).expect("load"),
    );
    let fp = fingerprint("pipeline.run", "r1");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let guard = Arc::clone(&guard);
        let fp = fp.clone();
        handles.push(tokio::spawn(async move { guard.claim(&fp).await.expect("claim") }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.expect("join") {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1);

    // Release makes the fingerprint claimable again.
    guard.release(&fp).await.expect("release");
    assert!(guard.claim(&fp).await.expect("claim after release"));
}

#[tokio::test]
async fn claims_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("idempotency.json");
    {
        let guard = IdempotencyGuard::load(&path).expect("load");
        assert!(guard.claim("pipeline.run:r9").await.expect("claim"));
    }
    let reloaded = IdempotencyGuard::load(&path).expect("reload");
    assert!(reloaded.is_claimed("pipeline.run:r9").await);
    assert!(!reloaded.claim("pipeline.run:r9").await.expect("claim held"));
}

// ── Dead-letter queue ────────────────────────────────────────────────────

fn dlq_config(max_retries: u32) -> DlqConfig {
    DlqConfig {
        enabled: true,
        path: None,
        max_retries,
        base_delay_ms: 0,
        backoff_factor: 2.0,
    }
}

fn json_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn enqueue_persists_one_file_per_delivery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dlq = DeadLetterQueue::new(dir.path(), &dlq_config(3));

    dlq.enqueue("http://127.0.0.1:1/hook", None, json!({"a": 1}), "refused")
        .await
        .expect("enqueue");
    dlq.enqueue("http://127.0.0.1:1/hook", Some("s"), json!({"b": 2}), "refused")
        .await
        .expect("enqueue");

    assert_eq!(json_files(dir.path()).len(), 2);
    assert_eq!(dlq.pending_count().await, 2);
}

#[tokio::test]
async fn exhausted_entries_are_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir");
    // max_retries 1 and attempts start at 1: the first failed sweep
    // pushes attempts past the budget.
    let dlq = DeadLetterQueue::new(dir.path(), &dlq_config(1));

    // Port 1 on localhost refuses connections immediately.
    dlq.enqueue("http://127.0.0.1:1/hook", None, json!({"x": true}), "refused")
        .await
        .expect("enqueue");

    let client = reqwest::Client::new();
    dlq.sweep(&client).await;

    assert_eq!(json_files(dir.path()).len(), 0, "entry left the live queue");
    let quarantined = json_files(&dir.path().join("quarantine"));
    assert_eq!(quarantined.len(), 1, "entry is kept for inspection");
    let contents = std::fs::read_to_string(&quarantined[0]).expect("read quarantined");
    assert!(contents.contains("\"attempts\": 2"));
}

#[tokio::test]
async fn future_entries_are_not_swept_early() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DlqConfig {
        enabled: true,
        path: None,
        max_retries: 3,
        base_delay_ms: 3_600_000,
        backoff_factor: 2.0,
    };
    let dlq = DeadLetterQueue::new(dir.path(), &config);
    dlq.enqueue("http://127.0.0.1:1/hook", None, json!({}), "refused")
        .await
        .expect("enqueue");

    let client = reqwest::Client::new();
    dlq.sweep(&client).await;
    // Not due for an hour: still exactly one live entry, no quarantine.
    assert_eq!(json_files(dir.path()).len(), 1);
    assert!(json_files(&dir.path().join("quarantine")).is_empty());
}
