use anyhow::{anyhow, Context, Result};
use tokio::process::Command;

use crate::types::DiffStats;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Thin async wrapper over the `git` CLI, rooted at one repository.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    pub async fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<ExecResult> {
        self.exec(&self.repo_path, args).await
    }

    async fn git_ok(&self, args: &[&str]) -> Result<()> {
        let result = self.git(args).await?;
        if !result.success() {
            return Err(anyhow!("git {} failed: {}", args.join(" "), result.combined_output()));
        }
        Ok(())
    }

    pub async fn fetch_origin(&self) -> Result<()> {
        self.git_ok(&["fetch", "origin"]).await
    }

    pub async fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.git(&["rev-parse", refname]).await?;
        if !result.success() {
            return Err(anyhow!("git rev-parse {refname} failed: {}", result.combined_output()));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub async fn checkout(&self, branch: &str) -> Result<()> {
        self.git_ok(&["checkout", branch]).await
    }

    /// Create (or reset) `branch` at `base` and check it out.
    pub async fn checkout_new(&self, branch: &str, base: &str) -> Result<()> {
        self.git_ok(&["checkout", "-B", branch, base]).await
    }

    /// Best-effort local branch delete; a missing branch is not an error.
    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        let _ = self.git(&["branch", "-D", branch]).await?;
        Ok(())
    }

    pub async fn delete_remote_branch(&self, branch: &str) -> Result<()> {
        let result = self.git(&["push", "origin", "--delete", branch]).await?;
        if !result.success() {
            return Err(anyhow!(
                "git push origin --delete {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// `merge --no-ff`; the caller inspects the result for conflicts.
    pub async fn merge_no_ff(&self, branch: &str) -> Result<ExecResult> {
        self.git(&["merge", "--no-ff", "--no-edit", branch]).await
    }

    pub async fn merge_abort(&self) -> Result<ExecResult> {
        self.git(&["merge", "--abort"]).await
    }

    /// True while a merge has staged conflicts (MERGE_HEAD exists).
    pub async fn merge_in_progress(&self) -> bool {
        self.rev_parse("MERGE_HEAD").await.is_ok()
    }

    /// Paths still carrying conflict markers.
    pub async fn conflicted_files(&self) -> Result<Vec<String>> {
        let result = self.git(&["diff", "--name-only", "--diff-filter=U"]).await?;
        if !result.success() {
            return Err(anyhow!("git diff --diff-filter=U failed: {}", result.combined_output()));
        }
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn push_force_with_lease(&self, branch: &str) -> Result<ExecResult> {
        self.git(&["push", "-u", "--force-with-lease", "origin", branch]).await
    }

    pub async fn rebase_onto(&self, upstream: &str) -> Result<ExecResult> {
        self.git(&["rebase", upstream]).await
    }

    pub async fn rebase_abort(&self) -> Result<ExecResult> {
        self.git(&["rebase", "--abort"]).await
    }

    pub async fn current_branch(&self) -> Result<String> {
        let result = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse --abbrev-ref HEAD failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub async fn status_clean(&self, dir: &str) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"]).await?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }

    /// Diff summary for the working branch in `worktree` against `base`.
    /// `--numstat` yields added/deleted per file; binary files report "-"
    /// and count as zero lines.
    pub async fn diff_stats(&self, worktree: &str, base: &str) -> Result<DiffStats> {
        let range = format!("{base}...HEAD");
        let numstat = self.exec(worktree, &["diff", "--numstat", &range]).await?;
        if !numstat.success() {
            return Err(anyhow!("git diff --numstat {range} failed: {}", numstat.combined_output()));
        }
        let mut stats = DiffStats::default();
        for line in numstat.stdout.lines() {
            let mut parts = line.split_whitespace();
            let added = parts.next().unwrap_or("0");
            let deleted = parts.next().unwrap_or("0");
            let file: String = parts.collect::<Vec<_>>().join(" ");
            if file.is_empty() {
                continue;
            }
            stats.files_changed += 1;
            stats.lines_added += added.parse::<u64>().unwrap_or(0);
            stats.lines_deleted += deleted.parse::<u64>().unwrap_or(0);
            stats.changed_files.push(file);
        }
        Ok(stats)
    }
}

// ── GitHub CLI ───────────────────────────────────────────────────────────

/// `gh` wrapper for the PR operations the integrator and merger need.
pub struct Gh {
    pub repo_path: String,
}

impl Gh {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    async fn gh(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn gh {}", args.join(" ")))?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Create a PR and return its URL.
    pub async fn pr_create(&self, base: &str, head: &str, title: &str, body: &str) -> Result<String> {
        let result = self
            .gh(&["pr", "create", "--base", base, "--head", head, "--title", title, "--body", body])
            .await?;
        if !result.success() {
            return Err(anyhow!("gh pr create {head} failed: {}", result.combined_output()));
        }
        // gh prints the PR URL as the last non-empty stdout line.
        result
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("https://"))
            .map(str::to_string)
            .ok_or_else(|| anyhow!("gh pr create returned no URL: {}", result.stdout))
    }

    pub async fn pr_merge_squash(&self, branch: &str) -> Result<()> {
        let result = self.gh(&["pr", "merge", branch, "--squash"]).await?;
        if !result.success() {
            return Err(anyhow!("gh pr merge {branch} failed: {}", result.combined_output()));
        }
        Ok(())
    }
}

/// Parse the PR number out of a GitHub PR URL (`.../pull/42`).
pub fn pr_number_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_number_parses_from_url() {
        assert_eq!(pr_number_from_url("https://github.com/org/repo/pull/42"), Some(42));
        assert_eq!(pr_number_from_url("https://github.com/org/repo/pull/42/"), Some(42));
        assert_eq!(pr_number_from_url("https://github.com/org/repo"), None);
    }
}
