use mainline_agent::tools::ToolSandbox;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn sandbox(dir: &tempfile::TempDir) -> ToolSandbox {
    ToolSandbox::new(dir.path(), None)
}

fn write(dir: &tempfile::TempDir, rel: &str, contents: &str) {
    let path = dir.path().join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, contents).expect("write");
}

// ── edit ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn edit_replaces_exactly_one_occurrence() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "src/lib.rs", "fn a() {}\nfn a() {}\n");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb
        .execute(
            "edit",
            &json!({"path": "src/lib.rs", "old_text": "fn a()", "new_text": "fn b()"}),
            &cancel,
        )
        .await;
    assert!(out.starts_with("edited"), "unexpected output: {out}");

    let contents = std::fs::read_to_string(dir.path().join("src/lib.rs")).expect("read");
    assert_eq!(contents, "fn b() {}\nfn a() {}\n");
}

#[tokio::test]
async fn edit_is_a_noop_on_mismatch() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "src/lib.rs", "fn a() {}\n");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb
        .execute(
            "edit",
            &json!({"path": "src/lib.rs", "old_text": "fn missing()", "new_text": "fn b()"}),
            &cancel,
        )
        .await;
    assert!(out.contains("not found"), "unexpected output: {out}");

    let contents = std::fs::read_to_string(dir.path().join("src/lib.rs")).expect("read");
    assert_eq!(contents, "fn a() {}\n", "file must be unchanged");
}

// ── read ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn read_honours_offset_and_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "notes.txt", "l0\nl1\nl2\nl3\nl4\n");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb
        .execute("read", &json!({"path": "notes.txt", "offset": 1, "limit": 2}), &cancel)
        .await;
    assert_eq!(out, "l1\nl2");
}

#[tokio::test]
async fn read_rejects_paths_outside_the_worktree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let traversal = sb.execute("read", &json!({"path": "../secret"}), &cancel).await;
    assert!(traversal.contains("tool error"), "unexpected output: {traversal}");

    let absolute = sb.execute("read", &json!({"path": "/etc/hostname"}), &cancel).await;
    assert!(absolute.contains("tool error"), "unexpected output: {absolute}");
}

// ── glob / grep ──────────────────────────────────────────────────────────

#[tokio::test]
async fn glob_matches_nested_paths_and_skips_git() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "src/a.rs", "");
    write(&dir, "src/deep/b.rs", "");
    write(&dir, "README.md", "");
    write(&dir, ".git/config.rs", "");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb.execute("glob", &json!({"pattern": "**/*.rs"}), &cancel).await;
    assert!(out.contains("src/a.rs"));
    assert!(out.contains("src/deep/b.rs"));
    assert!(!out.contains("README.md"));
    assert!(!out.contains(".git/"));
}

#[tokio::test]
async fn grep_finds_matching_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "src/main.rs", "fn main() {\n    let answer = 42;\n}\n");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb.execute("grep", &json!({"pattern": "answer = \\d+"}), &cancel).await;
    assert!(out.contains("answer = 42"), "unexpected output: {out}");
}

#[tokio::test]
async fn grep_without_matches_says_so() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "src/main.rs", "fn main() {}\n");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb.execute("grep", &json!({"pattern": "no_such_symbol"}), &cancel).await;
    assert!(out.contains("no matches"), "unexpected output: {out}");
}

// ── bash ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn bash_runs_in_the_worktree_and_reports_exit_codes() {
    let dir = tempfile::tempdir().expect("tempdir");
    write(&dir, "marker.txt", "here\n");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let ok = sb.execute("bash", &json!({"command": "ls"}), &cancel).await;
    assert!(ok.contains("marker.txt"));

    let failing = sb.execute("bash", &json!({"command": "exit 3"}), &cancel).await;
    assert!(failing.contains("[exit code 3]"), "unexpected output: {failing}");
}

#[tokio::test]
async fn bash_enforces_its_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb
        .execute("bash", &json!({"command": "sleep 5", "timeout": 1}), &cancel)
        .await;
    assert!(out.contains("timed out"), "unexpected output: {out}");
}

// ── browser gating ───────────────────────────────────────────────────────

#[tokio::test]
async fn browser_is_disabled_without_an_app_url() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb.execute("browser", &json!({"op": "navigate"}), &cancel).await;
    assert!(out.contains("not enabled"), "unexpected output: {out}");
}

#[tokio::test]
async fn unknown_tool_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sb = sandbox(&dir);
    let cancel = CancellationToken::new();

    let out = sb.execute("sudo", &json!({}), &cancel).await;
    assert!(out.contains("unknown tool"), "unexpected output: {out}");
}
