use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mainline_core::agent::{AgentContext, AgentExecutor};
use mainline_core::circuit::{guarded, CircuitBreaker};
use mainline_core::config::Config;
use mainline_core::types::{
    AgentResult, AgentRole, AgentRunMetadata, AgentStatus, Finding, FindingSeverity, TokenUsage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::models::{ModelFactory, ResolvedModel};
use crate::tools::{self, ToolSandbox};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
const MAX_CONTEXT_DOC_CHARS: usize = 4_000;

/// Drives one quality agent through an OpenAI-style chat loop: send the
/// role prompt with a tool schema, execute returned tool calls locally,
/// loop until the model answers without tools or the turn budget runs out,
/// then parse the reply into an `AgentResult`.
pub struct ChatExecutor {
    factory: ModelFactory,
    client: reqwest::Client,
    breaker: Option<Arc<CircuitBreaker>>,
    app_url: Option<String>,
}

impl ChatExecutor {
    pub fn new(config: &Config, breaker: Option<Arc<CircuitBreaker>>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            factory: ModelFactory::from_config(config),
            client,
            breaker,
            app_url: config.app_url.clone(),
        }
    }
}

#[async_trait]
impl AgentExecutor for ChatExecutor {
    async fn run_agent(&self, role: &AgentRole, ctx: AgentContext) -> Result<AgentResult> {
        let started = Instant::now();
        let resolved = self.factory.resolve(role)?;
        let sandbox = ToolSandbox::new(&ctx.worktree_path, self.app_url.clone());
        let browser_enabled =
            self.app_url.is_some() && role.tools.iter().any(|t| t == "browser");
        let tool_schemas = tools::schemas(&role.tools, browser_enabled);

        let mut messages = vec![
            ChatMessage::system(&role.system_prompt),
            ChatMessage::user(&task_prompt(role, &ctx, &sandbox)),
        ];
        let mut usage = TokenUsage::default();
        let mut turns: u32 = 0;
        let mut final_content: Option<String> = None;

        while turns < role.max_turns {
            turns += 1;
            let response = tokio::select! {
                response = self.chat(&resolved, &messages, &tool_schemas) => response?,
                _ = ctx.cancel.cancelled() => bail!("agent '{}' cancelled", role.name),
            };
            if let Some(api_usage) = &response.usage {
                usage.input += api_usage.prompt_tokens;
                usage.output += api_usage.completion_tokens;
            }
            let Some(choice) = response.choices.into_iter().next() else {
                bail!("chat endpoint returned no choices");
            };
            let message = choice.message;
            let tool_calls = message.tool_calls.clone().unwrap_or_default();
            let is_tool_turn =
                choice.finish_reason.as_deref() == Some("tool_calls") && !tool_calls.is_empty();

            if !is_tool_turn {
                final_content = message.content;
                break;
            }

            messages.push(message);
            for call in tool_calls {
                let args: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
                let output = sandbox.execute(&call.function.name, &args, &ctx.cancel).await;
                messages.push(ChatMessage::tool(&call.id, &output));
            }
        }

        if final_content.is_none() {
            warn!(agent = %role.name, "turn budget of {} exhausted", role.max_turns);
        }

        let metadata = AgentRunMetadata {
            duration_ms: started.elapsed().as_millis() as u64,
            turns_used: turns,
            tokens_used: usage,
            model: resolved.model.clone(),
            provider: resolved.provider.clone(),
        };
        let result = parse_result(&role.name, final_content.as_deref().unwrap_or(""), metadata);
        info!(
            agent = %role.name,
            status = ?result.status,
            findings = result.findings.len(),
            turns = result.metadata.turns_used,
            "agent finished"
        );
        Ok(result)
    }
}

impl ChatExecutor {
    async fn chat(
        &self,
        resolved: &ResolvedModel,
        messages: &[ChatMessage],
        tool_schemas: &[Value],
    ) -> Result<ChatResponse> {
        let request = ChatRequest {
            model: &resolved.model,
            messages,
            tools: if tool_schemas.is_empty() { None } else { Some(tool_schemas) },
        };
        let url = format!("{}/chat/completions", resolved.base_url.trim_end_matches('/'));
        guarded(self.breaker.as_deref(), || async {
            let mut builder = self.client.post(&url).json(&request);
            if let Some(key) = &resolved.api_key {
                builder = builder.bearer_auth(key);
            }
            let response = builder.send().await.context("chat request")?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("chat endpoint returned {status}: {body}");
            }
            response.json::<ChatResponse>().await.context("parse chat response")
        })
        .await
    }
}

// ── Prompt composition ───────────────────────────────────────────────────

fn task_prompt(role: &AgentRole, ctx: &AgentContext, _sandbox: &ToolSandbox) -> String {
    let mut s = format!(
        "Branch `{}` changed {} file(s) (+{} / -{} lines) in the worktree you are running in.\n",
        ctx.branch, ctx.diff.files_changed, ctx.diff.lines_added, ctx.diff.lines_deleted,
    );
    if !ctx.diff.changed_files.is_empty() {
        s.push_str("Changed files:\n");
        for file in ctx.diff.changed_files.iter().take(50) {
            s.push_str(&format!("  - {file}\n"));
        }
        if ctx.diff.changed_files.len() > 50 {
            s.push_str(&format!("  ... and {} more\n", ctx.diff.changed_files.len() - 50));
        }
    }
    if let Some(docs) = &role.context_docs {
        for doc in docs {
            let path = std::path::Path::new(&ctx.worktree_path).join(doc);
            if let Ok(contents) = std::fs::read_to_string(&path) {
                let clipped: String = contents.chars().take(MAX_CONTEXT_DOC_CHARS).collect();
                s.push_str(&format!("\n## {doc}\n{clipped}\n"));
            }
        }
    }
    s.push_str("\nReview the change per your role and reply with your structured verdict.");
    s
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn system(content: &str) -> Self {
        Self { role: "system".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    fn user(content: &str) -> Self {
        Self { role: "user".into(), content: Some(content.into()), tool_calls: None, tool_call_id: None }
    }

    fn tool(call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ── Verdict parsing ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default)]
    fixes_applied: Option<u32>,
}

#[derive(Deserialize)]
struct RawFinding {
    #[serde(default)]
    severity: Option<String>,
    description: String,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u64>,
    #[serde(default)]
    fix_applied: bool,
    #[serde(default)]
    fix_description: Option<String>,
}

/// Parse the model's final message into an `AgentResult`. A fenced or raw
/// JSON object is taken verbatim; anything else is wrapped into a single
/// `info` finding with `passed` status.
pub fn parse_result(agent: &str, content: &str, metadata: AgentRunMetadata) -> AgentResult {
    if let Some(raw) = extract_json(content) {
        if let Ok(verdict) = serde_json::from_str::<RawVerdict>(&raw) {
            let findings: Vec<Finding> = verdict
                .findings
                .into_iter()
                .map(|f| Finding {
                    severity: parse_severity(f.severity.as_deref()),
                    description: f.description,
                    file: f.file,
                    line: f.line,
                    fix_applied: f.fix_applied,
                    fix_description: f.fix_description,
                })
                .collect();
            let status = match verdict.status.as_deref() {
                Some("passed") => AgentStatus::Passed,
                Some("failed") => AgentStatus::Failed,
                Some("error") => AgentStatus::Error,
                _ if findings.iter().any(|f| !f.fix_applied) => AgentStatus::Failed,
                _ => AgentStatus::Passed,
            };
            return AgentResult {
                agent: agent.to_string(),
                status,
                fixes_applied: verdict
                    .fixes_applied
                    .unwrap_or_else(|| findings.iter().filter(|f| f.fix_applied).count() as u32),
                findings,
                metadata,
            };
        }
    }

    let description = if content.trim().is_empty() {
        "agent produced no structured output".to_string()
    } else {
        content.trim().to_string()
    };
    AgentResult {
        agent: agent.to_string(),
        status: AgentStatus::Passed,
        findings: vec![Finding {
            severity: FindingSeverity::Info,
            description,
            file: None,
            line: None,
            fix_applied: false,
            fix_description: None,
        }],
        fixes_applied: 0,
        metadata,
    }
}

/// Pull a JSON object out of the reply: a ```json fence, a bare fence, or
/// the raw text when it already looks like an object.
fn extract_json(content: &str) -> Option<String> {
    let trimmed = content.trim();
    for marker in ["```json", "```"] {
        if let Some(start) = trimmed.find(marker) {
            let rest = &trimmed[start + marker.len()..];
            if let Some(end) = rest.find("```") {
                let candidate = rest[..end].trim();
                if candidate.starts_with('{') {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    if trimmed.starts_with('{') {
        return Some(trimmed.to_string());
    }
    None
}

fn parse_severity(s: Option<&str>) -> FindingSeverity {
    match s {
        Some("info") => FindingSeverity::Info,
        Some("low") => FindingSeverity::Low,
        Some("high") => FindingSeverity::High,
        Some("critical") => FindingSeverity::Critical,
        _ => FindingSeverity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> AgentRunMetadata {
        AgentRunMetadata::default()
    }

    #[test]
    fn fenced_json_verdict_is_parsed() {
        let content = "Here is my verdict:\n```json\n{\"status\": \"failed\", \"findings\": \
            [{\"severity\": \"high\", \"description\": \"missing test\", \"file\": \"src/a.rs\", \
            \"fix_applied\": true}], \"fixes_applied\": 1}\n```";
        let result = parse_result("tests", content, meta());
        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.fixes_applied, 1);
        assert!(result.findings[0].fix_applied);
    }

    #[test]
    fn raw_json_verdict_is_parsed() {
        let content = r#"{"status": "passed", "findings": []}"#;
        let result = parse_result("style", content, meta());
        assert_eq!(result.status, AgentStatus::Passed);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn unstructured_output_becomes_info_finding() {
        let result = parse_result("style", "Everything looks fine to me.", meta());
        assert_eq!(result.status, AgentStatus::Passed);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].severity, FindingSeverity::Info);
    }

    #[test]
    fn missing_status_with_open_findings_fails() {
        let content = r#"{"findings": [{"description": "unchecked unwrap", "fix_applied": false}]}"#;
        let result = parse_result("style", content, meta());
        assert_eq!(result.status, AgentStatus::Failed);
    }
}
