//! Provider clients and their sync step tables.
//!
//! Each provider module exposes:
//! - an API trait (`SlackApi`, ...) returning typed `Page`s, with a reqwest implementation
//! - strategy objects plugged into the generic pipeline
//! - a `ProviderSync` implementation naming its ordered steps
//!
//! The `ProviderRegistry` holds one `ProviderSync` per enabled provider.

mod discord;
mod github;
mod linear;
mod slack;

pub use discord::{
    snowflake_after, DiscordApi, DiscordAuth, DiscordChannel, DiscordMember, DiscordMessage,
    DiscordSync, HttpDiscordApi,
};
pub use github::{
    standardize_event_name, GithubApi, GithubEvent, GithubRepository, GithubSync, GithubUser,
    HttpGithubApi,
};
pub use linear::{
    HttpLinearApi, LinearApi, LinearIssue, LinearProject, LinearSync, LinearTeam, LinearUser,
};
pub use slack::{
    slack_ts_from_datetime, slack_ts_to_datetime, HttpSlackApi, SlackApi, SlackChannel,
    SlackMessage, SlackSync, SlackUser,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc};
use pulse_store::{Integration, Provider, Store};
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::warn;

use crate::config::PulseConfig;
use crate::error::{ProviderError, SyncError};
use crate::sync::AdapterReport;

/// One page of a provider listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn with_cursor(items: Vec<T>, cursor: Option<String>) -> Self {
        Self {
            items,
            next_cursor: cursor.filter(|c| !c.is_empty()),
        }
    }
}

/// Everything a step needs; the integration is re-read before each step.
pub struct StepContext<'a> {
    pub store: &'a Store,
    pub integration: &'a Integration,
    /// Lower bound for time-bounded listings.
    pub min_event_at: DateTime<Utc>,
    pub max_pages: usize,
}

/// A provider's ordered sync steps.
#[async_trait]
pub trait ProviderSync: Send + Sync {
    fn provider(&self) -> Provider;

    /// Step names in dependency order: containers, members, events.
    fn steps(&self) -> &'static [&'static str];

    async fn run_step(&self, ctx: &StepContext<'_>, step: &str) -> Result<AdapterReport, SyncError>;
}

pub(crate) fn unknown_step(provider: Provider, step: &str) -> SyncError {
    SyncError::Config(format!("{} has no sync step named {}", provider.display_name(), step))
}

/// Registered provider syncs.
pub struct ProviderRegistry {
    providers: HashMap<Provider, Arc<dyn ProviderSync>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register reqwest-backed syncs for every enabled provider.
    pub fn from_config(config: &PulseConfig, http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        if config.is_enabled(Provider::Slack) {
            registry.register(Arc::new(SlackSync::new(
                HttpSlackApi::new(http.clone(), config.api_base_url(Provider::Slack)),
                config,
            )));
        }
        if config.is_enabled(Provider::Discord) {
            registry.register(Arc::new(DiscordSync::new(
                HttpDiscordApi::new(http.clone(), config.api_base_url(Provider::Discord)),
                config,
            )));
        }
        if config.is_enabled(Provider::Linear) {
            registry.register(Arc::new(LinearSync::new(
                HttpLinearApi::new(http.clone(), config.api_base_url(Provider::Linear)),
                config,
            )));
        }
        if config.is_enabled(Provider::Github) {
            registry.register(Arc::new(GithubSync::new(
                HttpGithubApi::new(http, config.api_base_url(Provider::Github)),
                config,
            )));
        }
        registry
    }

    pub fn register(&mut self, sync: Arc<dyn ProviderSync>) {
        self.providers.insert(sync.provider(), sync);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderSync>> {
        self.providers.get(&provider).cloned()
    }

    pub fn list_available(&self) -> Vec<Provider> {
        let mut available: Vec<Provider> = self.providers.keys().copied().collect();
        available.sort_by_key(|p| p.as_str());
        available
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Monday 00:00 UTC of the week containing `now`.
pub fn start_of_week(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = i64::from(now.weekday().num_days_from_monday());
    let monday = now.date_naive() - ChronoDuration::days(days_since_monday);
    monday.and_time(NaiveTime::MIN).and_utc()
}

/// Whole seconds from `Retry-After`; anything else falls back to the backoff delay.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// HTTP request helper with exponential backoff for rate limiting.
pub async fn call_with_backoff<F>(
    provider: &'static str,
    mut builder_fn: F,
) -> Result<reqwest::Response, ProviderError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut retries = 0;
    let mut delay = Duration::from_secs(1);
    let max_retries = 8;

    loop {
        let response = builder_fn()
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                provider,
                message: e.to_string(),
            })?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 && retries < max_retries {
            let wait = retry_after(response.headers()).unwrap_or(delay);

            warn!("{}: Rate limited, waiting {:?}", provider, wait);
            sleep(wait).await;

            retries += 1;
            delay = std::cmp::min(delay * 2, Duration::from_secs(60));
            continue;
        }

        if status.is_server_error() && retries < 3 {
            warn!("{}: Server error {}, retrying...", provider, status);
            sleep(delay).await;
            retries += 1;
            delay *= 2;
            continue;
        }

        let body = if status.as_u16() == 403 {
            "Access forbidden. Check the integration's permissions.".to_string()
        } else {
            response.text().await.unwrap_or_default()
        };
        return Err(ProviderError::Status {
            provider,
            status: status.as_u16(),
            body,
        });
    }
}

/// Read a JSON body, mapping failures to `Decode`.
pub(crate) async fn decode_json<T: DeserializeOwned>(
    provider: &'static str,
    endpoint: &str,
    response: reqwest::Response,
) -> Result<T, ProviderError> {
    let body = response.text().await.map_err(|e| ProviderError::Transport {
        provider,
        message: e.to_string(),
    })?;
    serde_json::from_str(&body).map_err(|e| ProviderError::Decode {
        provider,
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

/// Join an API base URL and a path without doubling slashes.
pub(crate) fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
