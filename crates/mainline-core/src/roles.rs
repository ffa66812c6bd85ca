use tracing::warn;

use crate::config::Config;
use crate::types::{AgentRole, Tier};

// ── System prompts ───────────────────────────────────────────────────────

const OUTPUT_CONTRACT: &str = "\n\nWhen you are done, reply with a single JSON object \
(optionally in a ```json fence) of the shape:\n\
{\"status\": \"passed\"|\"failed\", \"fixes_applied\": <number>, \"findings\": [{\"severity\": \
\"info\"|\"low\"|\"medium\"|\"high\"|\"critical\", \"description\": \"...\", \"file\": \"...\", \
\"line\": 0, \"fix_applied\": false, \"fix_description\": \"...\"}]}\n\
Report status \"failed\" only when findings remain that you could not fix.";

const TESTS_SYSTEM: &str = "You are a test-quality agent. Inspect the changed files and the \
project's test suite. Run the tests with the bash tool where a test command is discoverable. \
Flag changed behavior without test coverage, broken tests, and assertions weakened by the \
change. Apply small, safe test fixes with the edit tool and mark them fix_applied.";

const STYLE_SYSTEM: &str = "You are a style agent. Check the changed files for naming, \
formatting, dead code, and project-convention violations. Prefer fixing mechanically safe \
issues in place with the edit tool; report the rest as findings. Do not refactor logic.";

const SECURITY_SYSTEM: &str = "You are a security-review agent. Examine the changed files for \
injection risks, secret material, unsafe deserialization, path traversal, and missing \
validation at trust boundaries. Only apply a fix when it is unambiguous; otherwise report a \
finding with severity high or critical.";

const PERFORMANCE_SYSTEM: &str = "You are a performance-review agent. Look for accidental \
quadratic work, repeated I/O in loops, unbounded growth, and blocking calls on hot paths in \
the changed files. Report findings with concrete file and line references; fix only trivial \
cases.";

const DEFAULT_TOOLS: &[&str] = &["bash", "read", "edit", "glob", "grep"];
const DEFAULT_MAX_TURNS: u32 = 12;

// ── Role builders ────────────────────────────────────────────────────────

fn role(name: &str, system: &str, config: &Config) -> AgentRole {
    AgentRole {
        name: name.to_string(),
        system_prompt: format!("{system}{OUTPUT_CONTRACT}"),
        model: config.default_model.clone(),
        provider: config.default_provider.clone(),
        tools: DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect(),
        max_turns: DEFAULT_MAX_TURNS,
        context_docs: None,
    }
}

/// Look up a built-in role by name.
pub fn builtin(name: &str, config: &Config) -> Option<AgentRole> {
    match name {
        "tests" => Some(role("tests", TESTS_SYSTEM, config)),
        "style" => Some(role("style", STYLE_SYSTEM, config)),
        "security" => Some(role("security", SECURITY_SYSTEM, config)),
        "performance" => Some(role("performance", PERFORMANCE_SYSTEM, config)),
        _ => None,
    }
}

/// Agent names for a tier: the configured list, or the built-in default
/// when the config names none.
pub fn names_for_tier(tier: Tier, config: &Config) -> Vec<String> {
    let configured = &config.tiers.get(tier).agents;
    if !configured.is_empty() {
        return configured.clone();
    }
    let defaults: &[&str] = match tier {
        Tier::Small => &["tests", "style"],
        Tier::Medium => &["tests", "style", "security"],
        Tier::Large => &["tests", "style", "security", "performance"],
    };
    defaults.iter().map(|n| n.to_string()).collect()
}

/// Resolve a list of agent names to roles, dropping (and logging) names
/// with no definition.
pub fn resolve(names: &[String], config: &Config) -> Vec<AgentRole> {
    names
        .iter()
        .filter_map(|name| {
            let found = builtin(name, config);
            if found.is_none() {
                warn!("unknown quality agent '{name}' skipped");
            }
            found
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_defaults_grow_with_tier() {
        let config = Config::default();
        assert_eq!(names_for_tier(Tier::Small, &config).len(), 2);
        assert_eq!(names_for_tier(Tier::Medium, &config).len(), 3);
        assert_eq!(names_for_tier(Tier::Large, &config).len(), 4);
    }

    #[test]
    fn unknown_names_are_dropped() {
        let config = Config::default();
        let roles = resolve(&["tests".into(), "astrology".into()], &config);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "tests");
    }
}
