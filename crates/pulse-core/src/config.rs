//! Runtime configuration.
//!
//! Loaded from `~/.pulse/config.toml` (or `$PULSE_DATA_DIR/config.toml`).
//! A missing file means built-in defaults; secrets come from the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pulse_store::Provider;
use serde::{Deserialize, Serialize};

pub const ENV_LLM_API_KEY: &str = "PULSE_LLM_API_KEY";
pub const ENV_DATA_DIR: &str = "PULSE_DATA_DIR";
pub const ENV_MAX_PAGES: &str = "PULSE_SYNC_MAX_PAGES";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Iteration ceiling for one paginated listing.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_fanout_batch_size")]
    pub fanout_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            step_timeout_secs: default_step_timeout_secs(),
            fanout_batch_size: default_fanout_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Requested page size; clamped to the provider maximum.
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base_url: None,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub api_base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_event_page_limit")]
    pub event_page_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_base_url: default_llm_base_url(),
            api_key: None,
            seed: default_seed(),
            max_rounds: default_max_rounds(),
            event_page_limit: default_event_page_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_plan")]
    pub default_plan: String,
    /// Monthly generation allowance per plan.
    #[serde(default = "default_plan_limits")]
    pub plans: HashMap<String, i64>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            default_plan: default_plan(),
            plans: default_plan_limits(),
        }
    }
}

impl UsageConfig {
    pub fn plan_limit(&self, plan: &str) -> Option<i64> {
        self.plans.get(plan).copied()
    }
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> usize {
    10
}

fn default_step_timeout_secs() -> u64 {
    15 * 60
}

fn default_fanout_batch_size() -> usize {
    100
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_seed() -> u64 {
    123
}

fn default_max_rounds() -> usize {
    30
}

fn default_event_page_limit() -> usize {
    200
}

fn default_plan() -> String {
    "basic".to_string()
}

fn default_plan_limits() -> HashMap<String, i64> {
    HashMap::from([
        ("basic".to_string(), 100),
        ("startup".to_string(), 500),
        ("enterprise".to_string(), 10_000),
    ])
}

/// Largest page each provider accepts for its listings.
pub fn provider_max_page_size(provider: Provider) -> usize {
    match provider {
        Provider::Slack => 1000,
        Provider::Discord => 1000,
        Provider::Linear => 200,
        Provider::Github => 100,
    }
}

pub fn default_api_base_url(provider: Provider) -> &'static str {
    match provider {
        Provider::Slack => "https://slack.com/api",
        Provider::Discord => "https://discord.com/api/v10",
        Provider::Linear => "https://api.linear.app/graphql",
        Provider::Github => "https://api.github.com",
    }
}

impl PulseConfig {
    /// Load from TOML; a missing file yields defaults. Env overrides are applied.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_LLM_API_KEY).filter(|k| !k.is_empty()) {
            self.agent.api_key = Some(key);
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(pages) = lookup(ENV_MAX_PAGES).and_then(|v| v.parse().ok()) {
            self.sync.max_pages = pages;
        }
        // Every step fetches at least its first page.
        self.sync.max_pages = self.sync.max_pages.max(1);
    }

    pub fn provider(&self, provider: Provider) -> ProviderConfig {
        self.providers
            .get(provider.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        self.provider(provider).enabled
    }

    pub fn api_base_url(&self, provider: Provider) -> String {
        self.provider(provider)
            .api_base_url
            .unwrap_or_else(|| default_api_base_url(provider).to_string())
    }

    /// Configured page size clamped to `[1, provider maximum]`, or `fallback`.
    pub fn page_size(&self, provider: Provider, fallback: usize) -> usize {
        let max = provider_max_page_size(provider);
        self.provider(provider)
            .page_size
            .unwrap_or(fallback)
            .clamp(1, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PulseConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.max_pages, 10);
        assert_eq!(config.agent.seed, 123);
        assert_eq!(config.agent.max_rounds, 30);
        assert_eq!(config.agent.event_page_limit, 200);
        assert_eq!(config.usage.plan_limit("startup"), Some(500));
        assert!(config.is_enabled(Provider::Discord));
    }

    #[test]
    fn test_parse_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[sync]
max_pages = 3

[providers.github]
enabled = false

[providers.linear]
page_size = 5000
api_base_url = "http://localhost:9000/graphql"

[usage.plans]
basic = 7
"#
        )
        .unwrap();

        let config = PulseConfig::load(file.path()).unwrap();
        assert!(!config.is_enabled(Provider::Github));
        assert_eq!(config.page_size(Provider::Linear, 200), 200);
        assert_eq!(config.api_base_url(Provider::Linear), "http://localhost:9000/graphql");
        assert_eq!(config.api_base_url(Provider::Slack), "https://slack.com/api");
        assert_eq!(config.usage.plan_limit("basic"), Some(7));
        assert_eq!(config.usage.plan_limit("startup"), None);
        assert_eq!(config.agent.model, "gpt-4o-mini");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PulseConfig::default();
        config.apply_env(|key| match key {
            ENV_LLM_API_KEY => Some("sk-test".to_string()),
            ENV_DATA_DIR => Some("/tmp/pulse".to_string()),
            ENV_MAX_PAGES => Some("4".to_string()),
            _ => None,
        });
        assert_eq!(config.agent.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/pulse")));
        assert_eq!(config.sync.max_pages, 4);
    }

    #[test]
    fn test_zero_max_pages_is_raised_to_one() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[sync]\nmax_pages = 0\n").unwrap();
        let config = PulseConfig::load(file.path()).unwrap();
        assert_eq!(config.sync.max_pages, 1);

        let mut config = PulseConfig::default();
        config.apply_env(|key| (key == ENV_MAX_PAGES).then(|| "0".to_string()));
        assert_eq!(config.sync.max_pages, 1);
    }
}
