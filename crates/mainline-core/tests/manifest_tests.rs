use chrono::Utc;
use mainline_core::manifest::{ManifestManager, PrInfo};
use mainline_core::types::{BranchStage, ManifestReadyEntry};
use serde_json::json;

fn ready_entry(branch: &str) -> ManifestReadyEntry {
    ManifestReadyEntry {
        branch: branch.to_string(),
        pipeline_branch: format!("pipeline/{branch}"),
        worktree_path: format!("/w/{branch}"),
        request_id: format!("req-{branch}"),
        tier: None,
        pipeline_result: json!({"tests": "passed"}),
        corrections_applied: Vec::new(),
        ready_at: Utc::now(),
        priority: 10,
        depends_on: Vec::new(),
        base_branch: None,
        base_main_sha: "aaa111".into(),
        skip_merge: false,
        last_error: None,
    }
}

fn pr_info() -> PrInfo {
    PrInfo {
        integration_branch: "integration/feat/a".into(),
        pr_number: 42,
        pr_url: "https://github.com/org/repo/pull/42".into(),
        conflicts_resolved: 0,
        base_main_sha: "bbb222".into(),
    }
}

// ── Container round-trip ─────────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_lands_in_merge_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ManifestManager::new(dir.path());

    manager.add_to_ready(ready_entry("feat/a")).await.expect("add");
    manager.move_to_pending_merge("feat/a", pr_info()).await.expect("to pending");
    manager.move_to_merge_history("feat/a", Some("ccc333".into())).await.expect("to history");

    let manifest = manager.snapshot().await.expect("snapshot");
    assert!(manifest.ready.is_empty());
    assert!(manifest.pending_merge.is_empty());
    assert_eq!(manifest.merge_history.len(), 1);
    assert_eq!(manifest.merge_history[0].branch, "feat/a");
    assert_eq!(manifest.merge_history[0].pr_number, 42);
    assert_eq!(manifest.merge_history[0].merge_commit_sha.as_deref(), Some("ccc333"));
}

#[tokio::test]
async fn each_branch_occupies_exactly_one_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ManifestManager::new(dir.path());

    manager.add_to_ready(ready_entry("feat/a")).await.expect("add");
    // Re-adding while tracked anywhere is refused and leaves state intact.
    assert!(manager.add_to_ready(ready_entry("feat/a")).await.is_err());

    manager.move_to_pending_merge("feat/a", pr_info()).await.expect("to pending");
    assert!(manager.add_to_ready(ready_entry("feat/a")).await.is_err());

    let manifest = manager.snapshot().await.expect("snapshot");
    assert_eq!(manifest.container_of("feat/a"), Some(BranchStage::PendingMerge));
    assert_eq!(manifest.ready.len() + manifest.pending_merge.len(), 1);
}

#[tokio::test]
async fn invalid_moves_are_refused_without_mutation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ManifestManager::new(dir.path());

    assert!(manager.move_to_pending_merge("ghost", pr_info()).await.is_err());
    assert!(manager.move_to_merge_history("ghost", None).await.is_err());
    assert!(manager.rollback_to_ready("ghost").await.is_err());

    let manifest = manager.snapshot().await.expect("snapshot");
    assert!(manifest.ready.is_empty());
    assert!(manifest.pending_merge.is_empty());
    assert!(manifest.merge_history.is_empty());
}

// ── Rollback ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn rollback_returns_entry_to_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ManifestManager::new(dir.path());

    manager.add_to_ready(ready_entry("feat/b")).await.expect("add");
    manager.move_to_pending_merge("feat/b", pr_info()).await.expect("to pending");
    manager.rollback_to_ready("feat/b").await.expect("rollback");

    let manifest = manager.snapshot().await.expect("snapshot");
    assert_eq!(manifest.container_of("feat/b"), Some(BranchStage::Ready));
    // The PR info recorded at pending time does not leak back.
    assert_eq!(manifest.ready[0].branch, "feat/b");
}

// ── Failure bookkeeping ──────────────────────────────────────────────────

#[tokio::test]
async fn ready_error_is_recorded_and_cleared_on_promotion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ManifestManager::new(dir.path());

    manager.add_to_ready(ready_entry("feat/c")).await.expect("add");
    manager.set_ready_error("feat/c", "push rejected").await.expect("set error");

    let manifest = manager.snapshot().await.expect("snapshot");
    assert_eq!(manifest.ready[0].last_error.as_deref(), Some("push rejected"));

    manager.move_to_pending_merge("feat/c", pr_info()).await.expect("to pending");
    let manifest = manager.snapshot().await.expect("snapshot");
    assert!(manifest.pending_merge[0].entry.last_error.is_none());
    assert_eq!(manifest.pending_merge[0].entry.base_main_sha, "bbb222");
}

#[tokio::test]
async fn rebase_outcome_updates_pending_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = ManifestManager::new(dir.path());

    manager.add_to_ready(ready_entry("feat/d")).await.expect("add");
    manager.move_to_pending_merge("feat/d", pr_info()).await.expect("to pending");

    manager
        .set_pending_rebase("feat/d", Some("ddd444"), None)
        .await
        .expect("record rebase");
    let manifest = manager.snapshot().await.expect("snapshot");
    assert_eq!(manifest.pending_merge[0].entry.base_main_sha, "ddd444");

    manager
        .set_pending_rebase("feat/d", None, Some("rebase conflict"))
        .await
        .expect("record failed rebase");
    let manifest = manager.snapshot().await.expect("snapshot");
    // Failed rebase keeps the entry pending with the error noted.
    assert_eq!(manifest.container_of("feat/d"), Some(BranchStage::PendingMerge));
    assert_eq!(manifest.pending_merge[0].entry.last_error.as_deref(), Some("rebase conflict"));
}

// ── Durability ───────────────────────────────────────────────────────────

#[tokio::test]
async fn manifest_survives_manager_reconstruction() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let manager = ManifestManager::new(dir.path());
        manager.add_to_ready(ready_entry("feat/e")).await.expect("add");
    }
    let manager = ManifestManager::new(dir.path());
    let manifest = manager.snapshot().await.expect("snapshot");
    assert_eq!(manifest.container_of("feat/e"), Some(BranchStage::Ready));
}
