//! Row types for the normalized store.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// External platform an integration connects to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Slack,
    Discord,
    Linear,
    Github,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Slack,
        Provider::Discord,
        Provider::Linear,
        Provider::Github,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Slack => "slack",
            Provider::Discord => "discord",
            Provider::Linear => "linear",
            Provider::Github => "github",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Slack => "Slack",
            Provider::Discord => "Discord",
            Provider::Linear => "Linear",
            Provider::Github => "GitHub",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "slack" => Ok(Provider::Slack),
            "discord" => Ok(Provider::Discord),
            "linear" => Ok(Provider::Linear),
            "github" => Ok(Provider::Github),
            other => Err(anyhow!("unknown provider: {}", other)),
        }
    }
}

/// Kind of provider-scoped container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Channel,
    Repository,
    Team,
    Project,
    Server,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Channel => "channel",
            TargetKind::Repository => "repository",
            TargetKind::Team => "team",
            TargetKind::Project => "project",
            TargetKind::Server => "server",
        }
    }
}

impl FromStr for TargetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "channel" => Ok(TargetKind::Channel),
            "repository" => Ok(TargetKind::Repository),
            "team" => Ok(TargetKind::Team),
            "project" => Ok(TargetKind::Project),
            "server" => Ok(TargetKind::Server),
            other => Err(anyhow!("unknown target kind: {}", other)),
        }
    }
}

/// One configured connection between an organization and a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: i64,
    pub organization_id: String,
    pub provider: Provider,
    /// Credential used for provider calls (bot token, installation token, API key).
    pub credential: String,
    /// Provider-side account id (Slack team, GitHub installation, ...).
    pub external_account_id: Option<String>,
    pub sync_id: Option<i64>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_finished_at: Option<DateTime<Utc>>,
    pub sync_updated_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub sync_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub organization_id: String,
    pub provider: Provider,
    pub credential: String,
    pub external_account_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Failed,
    Completed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::Completed => "completed",
        }
    }
}

impl FromStr for SyncRunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(SyncRunStatus::Running),
            "failed" => Ok(SyncRunStatus::Failed),
            "completed" => Ok(SyncRunStatus::Completed),
            other => Err(anyhow!("unknown sync run status: {}", other)),
        }
    }
}

/// Persisted step cursor of one orchestrated sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub integration_id: i64,
    pub provider: Provider,
    pub next_step: usize,
    pub status: SyncRunStatus,
    pub min_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Canonical container row as produced by a sync adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub kind: TargetKind,
    pub external_id: String,
    pub parent_external_id: Option<String>,
    pub name: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTarget {
    pub id: i64,
    pub integration_id: i64,
    pub kind: TargetKind,
    pub external_id: String,
    pub parent_external_id: Option<String>,
    pub name: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical provider user row. `None` secrets mean "not supplied by this listing".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub external_user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub scopes: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_installer: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: i64,
    pub integration_id: i64,
    pub external_user_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub is_bot: bool,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub scopes: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_installer: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical event row as produced by a sync adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub external_id: String,
    pub kind: String,
    pub action: Option<String>,
    pub target_external_id: Option<String>,
    pub actor_external_id: Option<String>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub integration_id: i64,
    pub external_id: String,
    pub kind: String,
    pub action: Option<String>,
    pub target_external_id: Option<String>,
    pub actor_external_id: Option<String>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed-width RFC 3339 so TEXT columns compare chronologically.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Malformed stored timestamp: {:?}", value))
}

pub(crate) fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

pub(crate) fn parse_json(value: &str) -> serde_json::Value {
    serde_json::from_str(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trips_through_str() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
        assert!("gitlab".parse::<Provider>().is_err());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2025-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2025-01-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(ts(&early) < ts(&late));
        assert_eq!(parse_ts(&ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_malformed_timestamp_is_a_decode_error() {
        let err = parse_ts("last tuesday").unwrap_err();
        assert!(err.to_string().contains("last tuesday"));
        assert!(parse_opt_ts(Some(String::new())).is_err());
        assert_eq!(parse_opt_ts(None).unwrap(), None);
    }
}
