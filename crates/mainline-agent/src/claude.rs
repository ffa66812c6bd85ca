use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use mainline_core::agent::{AgentProcess, ProcessOutcome, ProcessSpec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::stream::parse_stream;

/// Runs the Claude Code CLI as a subprocess and parses its NDJSON stream.
///
/// This is the opaque `AgentProcess` behind conflict resolution and
/// reaction respawns; the subprocess owns its own tool use and git access
/// within `permission_mode`.
pub struct ClaudeCli {
    /// Path to the `claude` binary.
    pub claude_bin: String,
    /// Kill the subprocess and report failure after this long (0 = no limit).
    pub timeout_s: u64,
}

impl ClaudeCli {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self { claude_bin: claude_bin.into(), timeout_s: 1_800 }
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }
}

#[async_trait]
impl AgentProcess for ClaudeCli {
    async fn run(&self, spec: ProcessSpec) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let max_turns = spec.max_turns.to_string();

        info!(cwd = %spec.cwd, model = %spec.model, "spawning claude subprocess");

        let mut child = Command::new(&self.claude_bin)
            .arg("--model")
            .arg(&spec.model)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--permission-mode")
            .arg(&spec.permission_mode)
            .arg("--max-turns")
            .arg(&max_turns)
            .arg("--print")
            .arg(&spec.prompt)
            .current_dir(&spec.cwd)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!("claude stderr: {l}");
                            }
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!("claude stderr: {l}");
                }
            }

            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, exit_status.success()))
        };

        let cancelled = async {
            match &spec.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let run = async {
            if self.timeout_s > 0 {
                match tokio::time::timeout(Duration::from_secs(self.timeout_s), io_future).await {
                    Ok(result) => result.map(Some),
                    Err(_elapsed) => {
                        warn!(timeout_s = self.timeout_s, "claude subprocess timed out");
                        Ok(None)
                    }
                }
            } else {
                io_future.await.map(Some)
            }
        };

        let outcome = tokio::select! {
            result = run => result?,
            () = cancelled => {
                warn!("claude subprocess cancelled");
                None
            }
        };

        let Some((raw_stream, exit_ok)) = outcome else {
            return Ok(ProcessOutcome {
                success: false,
                output: String::new(),
                session_id: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        };

        let parsed = parse_stream(&raw_stream);
        let success = exit_ok && !parsed.is_error;

        info!(
            success,
            session_id = ?parsed.session_id,
            output_len = parsed.output.len(),
            "claude subprocess finished"
        );

        Ok(ProcessOutcome {
            success,
            output: parsed.output,
            session_id: parsed.session_id,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
