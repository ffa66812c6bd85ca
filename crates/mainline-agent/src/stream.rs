use serde::Deserialize;
use serde_json::Value;

/// A single NDJSON message from a CLI agent run with `--output-format
/// stream-json`. Only the fields the pipeline consumes are modeled.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// Final result message, emitted once at the very end.
    Result(ResultEvent),

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub num_turns: Option<u64>,
    pub duration_ms: Option<u64>,
}

/// Everything a caller needs from a finished CLI stream.
#[derive(Debug, Clone, Default)]
pub struct ParsedStream {
    pub output: String,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub num_turns: u64,
    pub duration_ms: u64,
}

/// Parse a full NDJSON stream. Unparseable lines are skipped; the final
/// result event wins, with collected assistant text as the fallback output.
pub fn parse_stream(data: &str) -> ParsedStream {
    let mut parsed = ParsedStream::default();
    let mut assistant_text = String::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let event: CliEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => continue,
        };
        match event {
            CliEvent::System(e) => {
                if let Some(sid) = e.session_id {
                    parsed.session_id = Some(sid);
                }
            }
            CliEvent::Assistant(e) => {
                let blocks = e.message.and_then(|m| m.content).unwrap_or_default();
                for block in blocks {
                    if let ContentBlock::Text { text } = block {
                        if !assistant_text.is_empty() {
                            assistant_text.push('\n');
                        }
                        assistant_text.push_str(&text);
                    }
                }
            }
            CliEvent::Result(e) => {
                if let Some(sid) = e.session_id {
                    parsed.session_id = Some(sid);
                }
                if let Some(text) = e.result {
                    parsed.output = text;
                }
                parsed.is_error = e.is_error.unwrap_or(false);
                parsed.num_turns = e.num_turns.unwrap_or(0);
                parsed.duration_ms = e.duration_ms.unwrap_or(0);
            }
            CliEvent::Unknown => {}
        }
    }

    if parsed.output.is_empty() && !assistant_text.is_empty() {
        parsed.output = assistant_text;
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_event_wins_over_assistant_text() {
        let data = r#"{"type":"system","session_id":"abc"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Working..."}]}}
{"type":"result","result":"All conflicts resolved.","session_id":"abc","is_error":false,"num_turns":6}"#;
        let parsed = parse_stream(data);
        assert_eq!(parsed.output, "All conflicts resolved.");
        assert_eq!(parsed.session_id.as_deref(), Some("abc"));
        assert!(!parsed.is_error);
        assert_eq!(parsed.num_turns, 6);
    }

    #[test]
    fn assistant_text_is_the_fallback() {
        let data = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"line one"}]}}
{"type":"assistant","message":{"content":[{"type":"text","text":"line two"}]}}"#;
        let parsed = parse_stream(data);
        assert_eq!(parsed.output, "line one\nline two");
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let data = "not json\n{\"type\":\"result\",\"result\":\"ok\",\"is_error\":false}";
        let parsed = parse_stream(data);
        assert_eq!(parsed.output, "ok");
    }

    #[test]
    fn error_flag_is_surfaced() {
        let data = r#"{"type":"result","result":"failed to resolve","is_error":true}"#;
        assert!(parse_stream(data).is_error);
    }
}
