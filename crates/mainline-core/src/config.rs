use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::Tier;

// ── Config document ──────────────────────────────────────────────────────

/// Per-tier classification bounds and agent list. `None` bounds mean
/// infinite (the `large` tier).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default)]
    pub max_files: Option<u64>,
    #[serde(default)]
    pub max_lines: Option<u64>,
    #[serde(default)]
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub small: TierConfig,
    pub medium: TierConfig,
    pub large: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            small: TierConfig {
                max_files: Some(3),
                max_lines: Some(50),
                agents: vec!["tests".into(), "style".into()],
            },
            medium: TierConfig {
                max_files: Some(15),
                max_lines: Some(500),
                agents: vec!["tests".into(), "style".into(), "security".into()],
            },
            large: TierConfig {
                max_files: None,
                max_lines: None,
                agents: vec![
                    "tests".into(),
                    "style".into(),
                    "security".into(),
                    "performance".into(),
                ],
            },
        }
    }
}

impl TiersConfig {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub pipeline_prefix: String,
    pub integration_prefix: String,
    pub main: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            pipeline_prefix: "pipeline/".into(),
            integration_prefix: "integration/".into(),
            main: "main".into(),
        }
    }
}

/// Settings for the CLI agent used for conflict resolution and respawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictAgentConfig {
    pub model: String,
    pub permission_mode: String,
    pub max_turns: u32,
}

impl Default for ConflictAgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-6".into(),
            permission_mode: "acceptEdits".into(),
            max_turns: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub conflict: ConflictAgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCorrectionConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
}

impl Default for AutoCorrectionConfig {
    fn default() -> Self {
        Self { max_attempts: 2, backoff_base_ms: 1_000, backoff_factor: 2.0 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakersConfig {
    pub claude: Option<CircuitBreakerConfig>,
    pub github: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub path: Option<String>,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            max_retries: 5,
            base_delay_ms: 5_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakersConfig,
    pub dlq: DlqConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorConfig {
    pub auto_trigger_delay_ms: u64,
    pub default_priority: u32,
    /// 0 disables the periodic cycle.
    pub schedule_interval_ms: u64,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self { auto_trigger_delay_ms: 2_000, default_priority: 10, schedule_interval_ms: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub keep_on_failure: bool,
    pub stale_branch_days: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { keep_on_failure: false, stale_branch_days: 7 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAdapterConfig {
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    /// Event-type filter; None delivers everything.
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default = "default_adapter_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_adapter_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub webhooks: Vec<WebhookAdapterConfig>,
    pub retry_interval_ms: u64,
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self { webhooks: Vec::new(), retry_interval_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    RespawnAgent,
    Notify,
    Escalate,
    AutoMerge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionConfig {
    pub action: ReactionAction,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckReactionConfig {
    /// Minutes of inactivity before the stuck timer fires.
    pub after_min: u64,
    pub action: ReactionAction,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactionsConfig {
    pub ci_failed: Option<ReactionConfig>,
    pub changes_requested: Option<ReactionConfig>,
    pub approved_and_green: Option<ReactionConfig>,
    pub agent_stuck: Option<StuckReactionConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub path: Option<String>,
}

/// Full application configuration: a JSON document plus environment
/// overrides (`EVENTS_PATH`, `PROJECT_PATH`, `PORT`), with a `.env` file
/// honored for the overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tiers: TiersConfig,
    pub branch: BranchConfig,
    pub agents: AgentsConfig,
    pub auto_correction: AutoCorrectionConfig,
    /// 0 disables the run deadline.
    pub pipeline_timeout_ms: u64,
    pub resilience: ResilienceConfig,
    pub director: DirectorConfig,
    pub cleanup: CleanupConfig,
    pub adapters: AdaptersConfig,
    pub llm_providers: HashMap<String, ProviderConfig>,
    pub default_provider: String,
    pub fallback_provider: Option<String>,
    pub default_model: String,
    pub webhook_secret: Option<String>,
    pub events: EventsConfig,
    pub reactions: ReactionsConfig,
    /// Base URL of the app under test, enabling the browser tool.
    pub app_url: Option<String>,

    // Resolved from environment at load time.
    #[serde(skip)]
    pub project_path: String,
    #[serde(skip)]
    pub port: u16,
    #[serde(skip)]
    events_path_override: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tiers: TiersConfig::default(),
            branch: BranchConfig::default(),
            agents: AgentsConfig::default(),
            auto_correction: AutoCorrectionConfig::default(),
            pipeline_timeout_ms: 0,
            resilience: ResilienceConfig::default(),
            director: DirectorConfig::default(),
            cleanup: CleanupConfig::default(),
            adapters: AdaptersConfig::default(),
            llm_providers: HashMap::new(),
            default_provider: "anthropic".into(),
            fallback_provider: None,
            default_model: "claude-sonnet-4-6".into(),
            webhook_secret: None,
            events: EventsConfig::default(),
            reactions: ReactionsConfig::default(),
            app_url: None,
            project_path: ".".into(),
            port: 3141,
            events_path_override: None,
        }
    }
}

impl Config {
    /// Load the config file (missing file = all defaults) and apply
    /// environment overrides. A present-but-invalid file is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e).with_context(|| format!("read config {}", path.display())),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        let dotenv = parse_dotenv();
        self.project_path = get_str("PROJECT_PATH", &dotenv, ".");
        self.port = get_u16("PORT", &dotenv, 3141);
        self.events_path_override = get("EVENTS_PATH", &dotenv).filter(|s| !s.is_empty());
    }

    /// Root of all persisted pipeline state.
    pub fn pipeline_dir(&self) -> PathBuf {
        Path::new(&self.project_path).join(".pipeline")
    }

    /// `EVENTS_PATH` wins over the config key; default lives under
    /// `.pipeline/`.
    pub fn events_path(&self) -> PathBuf {
        if let Some(p) = &self.events_path_override {
            return PathBuf::from(p);
        }
        match &self.events.path {
            Some(p) => PathBuf::from(p),
            None => self.pipeline_dir().join("pipeline-events"),
        }
    }

    pub fn dlq_path(&self) -> PathBuf {
        match &self.resilience.dlq.path {
            Some(p) => PathBuf::from(p),
            None => self.pipeline_dir().join("dlq"),
        }
    }

    pub fn sagas_path(&self) -> PathBuf {
        self.pipeline_dir().join("sagas")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.pipeline_dir().join("sessions")
    }

    pub fn pipeline_branch_for(&self, branch: &str) -> String {
        format!("{}{}", self.branch.pipeline_prefix, branch)
    }

    pub fn integration_branch_for(&self, branch: &str) -> String {
        format!("{}{}", self.branch.integration_prefix, branch)
    }
}

// ── Environment helpers ──────────────────────────────────────────────────

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_builtin_tiers() {
        let config = Config::default();
        assert_eq!(config.tiers.small.max_files, Some(3));
        assert!(config.tiers.large.max_files.is_none());
        assert_eq!(config.branch.main, "main");
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"pipeline_timeout_ms": 60000}"#).expect("parse");
        assert_eq!(config.pipeline_timeout_ms, 60_000);
        assert_eq!(config.auto_correction.max_attempts, 2);
        assert_eq!(config.director.default_priority, 10);
    }

    #[test]
    fn invalid_document_is_an_error() {
        let result = serde_json::from_str::<Config>(r#"{"pipeline_timeout_ms": "soon"}"#);
        assert!(result.is_err());
    }
}
