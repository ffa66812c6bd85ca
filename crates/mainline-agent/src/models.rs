use std::collections::HashMap;

use anyhow::{bail, Result};
use mainline_core::config::{Config, ProviderConfig};
use mainline_core::types::AgentRole;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Endpoint details resolved for one agent run.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Maps a role's provider name to a chat endpoint.
///
/// Providers come from `llm_providers`; API keys are read from the
/// environment variable each provider names, never stored. An unknown
/// provider falls back to `fallback_provider` before failing.
pub struct ModelFactory {
    providers: HashMap<String, ProviderConfig>,
    default_provider: String,
    fallback_provider: Option<String>,
}

impl ModelFactory {
    pub fn from_config(config: &Config) -> Self {
        Self {
            providers: config.llm_providers.clone(),
            default_provider: config.default_provider.clone(),
            fallback_provider: config.fallback_provider.clone(),
        }
    }

    pub fn resolve(&self, role: &AgentRole) -> Result<ResolvedModel> {
        let wanted = if role.provider.is_empty() { &self.default_provider } else { &role.provider };
        let (name, provider) = if let Some(p) = self.providers.get(wanted) {
            (wanted.clone(), p.clone())
        } else if let Some(p) = self
            .fallback_provider
            .as_ref()
            .and_then(|f| self.providers.get(f).map(|p| (f.clone(), p.clone())))
        {
            warn!("provider '{wanted}' not configured, falling back to '{}'", p.0);
            p
        } else if self.providers.is_empty() {
            // No provider table at all: default endpoint, key from the
            // conventional variable if present.
            (wanted.clone(), ProviderConfig::default())
        } else {
            bail!("no llm provider configured for '{wanted}'");
        };

        let api_key = provider
            .api_key_env
            .as_deref()
            .or(Some("OPENAI_API_KEY"))
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        Ok(ResolvedModel {
            provider: name,
            model: role.model.clone(),
            base_url: provider.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        })
    }
}
