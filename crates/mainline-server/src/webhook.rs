use hmac::{Hmac, Mac};
use mainline_core::config::Config;
use mainline_core::types::{PipelineEvent, PipelineEventType};
use regex::Regex;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::OnceLock;

type HmacSha256 = Hmac<Sha256>;

/// Validate `X-Hub-Signature-256: sha256=<hex>` against the shared secret.
/// Uses the MAC's constant-time verification.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header else { return false };
    let Some(hex_sig) = header.strip_prefix("sha256=") else { return false };
    let Ok(expected) = hex::decode(hex_sig) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Branches named `issue/<n>` carry their issue number.
pub fn issue_number_from_branch(branch: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    let re = RE.get_or_init(|| Regex::new(r"^issue/(\d+)").expect("static regex"));
    re.captures(branch)?.get(1)?.as_str().parse().ok()
}

/// Translate one VCS webhook delivery into internal events.
/// Unknown event kinds and irrelevant actions yield no events.
pub fn translate(kind: &str, payload: &Value, config: &Config) -> Vec<PipelineEvent> {
    match kind {
        "pull_request" => translate_pull_request(payload, config),
        "pull_request_review" => translate_review(payload, config),
        "check_suite" => translate_check_suite(payload),
        _ => Vec::new(),
    }
}

fn translate_pull_request(payload: &Value, config: &Config) -> Vec<PipelineEvent> {
    let action = payload.get("action").and_then(Value::as_str).unwrap_or("");
    let pr = &payload["pull_request"];
    let branch = pr["head"]["ref"].as_str().unwrap_or("");
    if branch.is_empty() {
        return Vec::new();
    }
    let pr_number = pr["number"].as_u64();
    let pr_url = pr["html_url"].as_str().unwrap_or("");

    match action {
        "opened" | "synchronize" => {
            vec![session_event(
                PipelineEventType::SessionReviewRequested,
                branch,
                json!({
                    "session_id": branch,
                    "branch": branch,
                    "prNumber": pr_number,
                    "issueNumber": issue_number_from_branch(branch),
                    "pr_url": pr_url,
                    "projectPath": config.project_path,
                }),
            )]
        }
        "closed" if pr["merged"].as_bool() == Some(true) => {
            let prefix = &config.branch.integration_prefix;
            let Some(source_branch) = branch.strip_prefix(prefix.as_str()) else {
                return Vec::new();
            };
            vec![PipelineEvent::new(
                PipelineEventType::IntegrationPrMerged,
                source_branch,
                json!({
                    "branch": source_branch,
                    "integration_branch": branch,
                    "pipeline_branch": config.pipeline_branch_for(source_branch),
                    "merge_commit_sha": pr["merge_commit_sha"].as_str(),
                    "pr_number": pr_number,
                    "pr_url": pr_url,
                }),
            )]
        }
        _ => Vec::new(),
    }
}

fn translate_review(payload: &Value, config: &Config) -> Vec<PipelineEvent> {
    let state = payload["review"]["state"].as_str().unwrap_or("");
    let pr = &payload["pull_request"];
    let branch = pr["head"]["ref"].as_str().unwrap_or("");
    if branch.is_empty() {
        return Vec::new();
    }
    let base = json!({
        "session_id": branch,
        "branch": branch,
        "prNumber": pr["number"].as_u64(),
        "issueNumber": issue_number_from_branch(branch),
        "pr_url": pr["html_url"].as_str(),
    });

    match state {
        "approved" => {
            let mut data = base;
            data["approved"] = json!(true);
            let mut events =
                vec![session_event(PipelineEventType::SessionReviewRequested, branch, data.clone())];
            if config.reactions.approved_and_green.is_some() {
                events.push(session_event(PipelineEventType::PrApproved, branch, data));
            }
            events
        }
        "changes_requested" => {
            vec![session_event(PipelineEventType::SessionChangesRequested, branch, base)]
        }
        _ => Vec::new(),
    }
}

fn translate_check_suite(payload: &Value) -> Vec<PipelineEvent> {
    let suite = &payload["check_suite"];
    let branch = suite["head_branch"].as_str().unwrap_or("");
    if branch.is_empty() {
        return Vec::new();
    }
    let conclusion = suite["conclusion"].as_str().unwrap_or("");
    let data = json!({
        "session_id": branch,
        "branch": branch,
        "sha": suite["head_sha"].as_str(),
        "conclusion": conclusion,
        "issueNumber": issue_number_from_branch(branch),
    });
    match conclusion {
        "success" => vec![session_event(PipelineEventType::SessionCiPassed, branch, data)],
        "failure" | "timed_out" => {
            vec![session_event(PipelineEventType::SessionCiFailed, branch, data)]
        }
        _ => Vec::new(),
    }
}

fn session_event(event_type: PipelineEventType, branch: &str, data: Value) -> PipelineEvent {
    PipelineEvent::new(event_type, branch, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mainline_core::config::Config;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn signature_round_trip() {
        let body = br#"{"action":"opened"}"#;
        let sig = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, Some(&sig)));
        assert!(!verify_signature("other", body, Some(&sig)));
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("sha256=zz")));
    }

    #[test]
    fn issue_branches_yield_numbers() {
        assert_eq!(issue_number_from_branch("issue/42-fix-login"), Some(42));
        assert_eq!(issue_number_from_branch("issue/7"), Some(7));
        assert_eq!(issue_number_from_branch("feat/a"), None);
    }

    #[test]
    fn opened_pr_becomes_review_requested() {
        let config = Config::default();
        let payload = serde_json::json!({
            "action": "opened",
            "pull_request": {
                "number": 12,
                "html_url": "https://github.com/org/repo/pull/12",
                "head": {"ref": "issue/42-fix"},
            },
        });
        let events = translate("pull_request", &payload, &config);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PipelineEventType::SessionReviewRequested);
        assert_eq!(events[0].data["issueNumber"], 42);
        assert_eq!(events[0].data["prNumber"], 12);
    }

    #[test]
    fn merged_integration_pr_is_translated() {
        let config = Config::default();
        let payload = serde_json::json!({
            "action": "closed",
            "pull_request": {
                "number": 42,
                "merged": true,
                "merge_commit_sha": "abc123",
                "html_url": "https://github.com/org/repo/pull/42",
                "head": {"ref": "integration/feat/b"},
            },
        });
        let events = translate("pull_request", &payload, &config);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PipelineEventType::IntegrationPrMerged);
        assert_eq!(events[0].data["branch"], "feat/b");
        assert_eq!(events[0].data["pipeline_branch"], "pipeline/feat/b");
        assert_eq!(events[0].data["merge_commit_sha"], "abc123");
    }

    #[test]
    fn merged_non_integration_pr_is_ignored() {
        let config = Config::default();
        let payload = serde_json::json!({
            "action": "closed",
            "pull_request": {
                "number": 9,
                "merged": true,
                "head": {"ref": "feat/unrelated"},
            },
        });
        assert!(translate("pull_request", &payload, &config).is_empty());
    }

    #[test]
    fn check_suite_conclusions_map_to_ci_events() {
        let payload = |conclusion: &str| {
            serde_json::json!({
                "check_suite": {
                    "head_branch": "issue/7",
                    "head_sha": "deadbeef",
                    "conclusion": conclusion,
                },
            })
        };
        let ok = translate_check_suite(&payload("success"));
        assert_eq!(ok[0].event_type, PipelineEventType::SessionCiPassed);
        let failed = translate_check_suite(&payload("failure"));
        assert_eq!(failed[0].event_type, PipelineEventType::SessionCiFailed);
        let timed_out = translate_check_suite(&payload("timed_out"));
        assert_eq!(timed_out[0].event_type, PipelineEventType::SessionCiFailed);
        assert!(translate_check_suite(&payload("neutral")).is_empty());
    }

    #[test]
    fn approved_review_emits_pr_approved_when_enabled() {
        let mut config = Config::default();
        config.reactions.approved_and_green = Some(mainline_core::config::ReactionConfig {
            action: mainline_core::config::ReactionAction::AutoMerge,
            max_retries: 0,
            prompt: None,
            message: None,
        });
        let payload = serde_json::json!({
            "review": {"state": "approved"},
            "pull_request": {"number": 3, "head": {"ref": "issue/9"}},
        });
        let events = translate("pull_request_review", &payload, &config);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, PipelineEventType::SessionReviewRequested);
        assert_eq!(events[0].data["approved"], true);
        assert_eq!(events[1].event_type, PipelineEventType::PrApproved);
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let config = Config::default();
        assert!(translate("workflow_dispatch", &serde_json::json!({}), &config).is_empty());
    }
}
