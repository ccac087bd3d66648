pub mod connect;
pub mod generate;
pub mod link;
pub mod status;
pub mod sync;
pub mod usage;

use std::path::Path;

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use pulse_core::providers::start_of_week;
use pulse_core::PulseConfig;
use pulse_store::{Provider, Store};
use tracing::debug;

use crate::paths;

/// Loaded configuration plus the opened store, shared by every command.
pub struct Context {
    pub config: PulseConfig,
    pub store: Store,
}

impl Context {
    pub async fn load(config_override: Option<&Path>) -> Result<Self> {
        let config_path = config_override
            .map(Path::to_path_buf)
            .unwrap_or_else(paths::config_path);
        let config = PulseConfig::load(&config_path)?;
        let db_path = paths::db_path(&config);
        debug!("Opening store at {}", db_path.display());
        let store = Store::open(&db_path)
            .await
            .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
        Ok(Self { config, store })
    }

    pub fn http(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder().user_agent("pulse").build()?)
    }
}

pub fn parse_provider(value: &str) -> Result<Provider> {
    value
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| anyhow!("Unknown provider: {} (expected slack, discord, linear or github)", value))
}

pub fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("--{} must be an RFC 3339 timestamp, got {}", field, value))
}

/// `[from, to]`, defaulting to the current week so far.
pub fn window(from: Option<&str>, to: Option<&str>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let now = Utc::now();
    let to = to.map(|v| parse_time("to", v)).transpose()?.unwrap_or(now);
    let from = from
        .map(|v| parse_time("from", v))
        .transpose()?
        .unwrap_or_else(|| start_of_week(to));
    Ok((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_defaults_to_week_start() {
        let (from, to) = window(None, Some("2025-03-13T15:00:00Z")).unwrap();
        assert_eq!(to, Utc.with_ymd_and_hms(2025, 3, 13, 15, 0, 0).unwrap());
        assert_eq!(from, Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
        assert!(window(Some("last tuesday"), None).is_err());
    }

    #[test]
    fn test_parse_provider_is_case_insensitive() {
        assert_eq!(parse_provider("GitHub").unwrap(), Provider::Github);
        assert!(parse_provider("notion").is_err());
    }

    #[tokio::test]
    async fn test_context_honors_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            format!("data_dir = {:?}\n", dir.path().join("data").display().to_string()),
        )
        .unwrap();

        let ctx = Context::load(Some(&config_path)).await.unwrap();
        assert!(ctx.store.list_integrations(None).await.unwrap().is_empty());
        assert!(dir.path().join("data").join("pulse.db").exists());
    }
}
