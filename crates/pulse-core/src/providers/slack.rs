//! Slack provider.
//!
//! Syncs channels (exhaustive, reconciled), workspace members and channel
//! history. Message events are keyed `slack:{team}:{channel}:{ts}`.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pulse_store::{EventRow, Provider, ReconcileScope, TargetKind, TargetRow, UserRow};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{call_with_backoff, decode_json, endpoint_url, unknown_step, Page, ProviderSync, StepContext};
use crate::config::PulseConfig;
use crate::error::{ProviderError, SyncError};
use crate::sync::{run_adapter, AdapterReport, SyncStrategy};

const PROVIDER: &str = "slack";
const STEPS: &[&str] = &["channels", "users", "messages"];
const LISTING_MAX: usize = 999;
const HISTORY_MAX: usize = 1000;

#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn list_channels(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<SlackChannel>, ProviderError>;

    async fn list_users(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<SlackUser>, ProviderError>;

    /// Messages posted after `oldest` (a Slack timestamp).
    async fn channel_history(
        &self,
        token: &str,
        channel: &str,
        oldest: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<SlackMessage>, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannel {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub is_general: bool,
    #[serde(default)]
    pub is_shared: bool,
    pub topic: Option<SlackText>,
    pub purpose: Option<SlackText>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackText {
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackUser {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub is_bot: bool,
    pub profile: Option<SlackProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackProfile {
    pub display_name: Option<String>,
    pub real_name: Option<String>,
    pub email: Option<String>,
    pub image_original: Option<String>,
    pub image_72: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackMessage {
    pub ts: Option<String>,
    pub user: Option<String>,
    pub text: Option<String>,
    pub subtype: Option<String>,
    pub thread_ts: Option<String>,
    pub client_msg_id: Option<String>,
    pub team: Option<String>,
    pub reply_count: Option<u32>,
    pub blocks: Option<serde_json::Value>,
    pub attachments: Option<serde_json::Value>,
    pub files: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SlackResponseMetadata {
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackChannelsResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    channels: Vec<SlackChannel>,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct SlackUsersResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    members: Vec<SlackUser>,
    response_metadata: Option<SlackResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct SlackHistoryResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    response_metadata: Option<SlackResponseMetadata>,
}

fn rejected(method: &str, error: Option<String>) -> ProviderError {
    ProviderError::Rejected {
        provider: PROVIDER,
        endpoint: method.to_string(),
        message: error.unwrap_or_else(|| "unknown".to_string()),
    }
}

fn next_cursor(meta: Option<SlackResponseMetadata>) -> Option<String> {
    meta.and_then(|m| m.next_cursor)
}

/// Slack Web API over reqwest.
pub struct HttpSlackApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSlackApi {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn get(
        &self,
        token: &str,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<reqwest::Response, ProviderError> {
        let url = endpoint_url(&self.base_url, method);
        call_with_backoff(PROVIDER, || self.http.get(&url).bearer_auth(token).query(params)).await
    }
}

fn paging_params(cursor: Option<&str>, limit: usize) -> Vec<(&'static str, String)> {
    let mut params = vec![("limit", limit.to_string())];
    if let Some(c) = cursor {
        params.push(("cursor", c.to_string()));
    }
    params
}

#[async_trait]
impl SlackApi for HttpSlackApi {
    async fn list_channels(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<SlackChannel>, ProviderError> {
        let mut params = paging_params(cursor, limit);
        params.push(("types", "public_channel,private_channel".to_string()));
        let response = self.get(token, "conversations.list", &params).await?;
        let payload: SlackChannelsResponse = decode_json(PROVIDER, "conversations.list", response).await?;
        if !payload.ok {
            return Err(rejected("conversations.list", payload.error));
        }
        Ok(Page::with_cursor(payload.channels, next_cursor(payload.response_metadata)))
    }

    async fn list_users(
        &self,
        token: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<SlackUser>, ProviderError> {
        let params = paging_params(cursor, limit);
        let response = self.get(token, "users.list", &params).await?;
        let payload: SlackUsersResponse = decode_json(PROVIDER, "users.list", response).await?;
        if !payload.ok {
            return Err(rejected("users.list", payload.error));
        }
        Ok(Page::with_cursor(payload.members, next_cursor(payload.response_metadata)))
    }

    async fn channel_history(
        &self,
        token: &str,
        channel: &str,
        oldest: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<SlackMessage>, ProviderError> {
        let mut params = paging_params(cursor, limit);
        params.push(("channel", channel.to_string()));
        params.push(("oldest", oldest.to_string()));
        let response = self.get(token, "conversations.history", &params).await?;
        let payload: SlackHistoryResponse =
            decode_json(PROVIDER, "conversations.history", response).await?;
        if !payload.ok {
            return Err(rejected("conversations.history", payload.error));
        }
        Ok(Page::with_cursor(payload.messages, next_cursor(payload.response_metadata)))
    }
}

/// Parse a Slack `ts` ("1704067200.000100") into a UTC instant.
pub fn slack_ts_to_datetime(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = format!("{:0<6}", frac).get(..6)?.parse().ok()?;
    Utc.timestamp_opt(secs, micros * 1000).single()
}

pub fn slack_ts_from_datetime(dt: DateTime<Utc>) -> String {
    format!("{}.{:06}", dt.timestamp(), dt.timestamp_subsec_micros())
}

struct ChannelListing<'a, A> {
    api: &'a A,
    token: &'a str,
    page_size: usize,
}

#[async_trait]
impl<'a, A: SlackApi> SyncStrategy for ChannelListing<'a, A> {
    type Record = SlackChannel;
    type Row = TargetRow;

    fn entity(&self) -> String {
        "slack channels".to_string()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<SlackChannel>, ProviderError> {
        self.api.list_channels(self.token, cursor, limit).await
    }

    fn map(&self, channel: SlackChannel) -> Result<TargetRow, &'static str> {
        let id = channel.id.ok_or("channel with no id")?;
        let name = channel.name.ok_or("channel with no name")?;
        Ok(TargetRow {
            kind: TargetKind::Channel,
            external_id: id,
            parent_external_id: None,
            name,
            metadata: json!({
                "is_private": channel.is_private,
                "is_archived": channel.is_archived,
                "is_general": channel.is_general,
                "is_shared": channel.is_shared,
                "topic": channel.topic.and_then(|t| t.value),
                "purpose": channel.purpose.and_then(|p| p.value),
            }),
        })
    }

    fn reconcile_scope(&self) -> Option<ReconcileScope> {
        Some(ReconcileScope::kind(TargetKind::Channel))
    }
}

struct UserListing<'a, A> {
    api: &'a A,
    token: &'a str,
    page_size: usize,
}

#[async_trait]
impl<'a, A: SlackApi> SyncStrategy for UserListing<'a, A> {
    type Record = SlackUser;
    type Row = UserRow;

    fn entity(&self) -> String {
        "slack users".to_string()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<SlackUser>, ProviderError> {
        self.api.list_users(self.token, cursor, limit).await
    }

    fn map(&self, user: SlackUser) -> Result<UserRow, &'static str> {
        let id = user.id.ok_or("user with no id")?;
        let name = user.name.ok_or("user with no name")?;
        if user.deleted {
            return Err("deleted user");
        }
        let profile = user.profile;
        Ok(UserRow {
            external_user_id: id,
            username: name,
            display_name: profile
                .as_ref()
                .and_then(|p| p.display_name.clone().filter(|n| !n.is_empty()).or(p.real_name.clone())),
            email: profile.as_ref().and_then(|p| p.email.clone()),
            avatar_url: profile
                .as_ref()
                .and_then(|p| p.image_original.clone().or(p.image_72.clone())),
            is_bot: user.is_bot,
            ..Default::default()
        })
    }
}

struct ChannelHistory<'a, A> {
    api: &'a A,
    token: &'a str,
    team_id: &'a str,
    channel_id: &'a str,
    oldest: String,
    bound: DateTime<Utc>,
    page_size: usize,
}

#[async_trait]
impl<'a, A: SlackApi> SyncStrategy for ChannelHistory<'a, A> {
    type Record = SlackMessage;
    type Row = EventRow;

    fn entity(&self) -> String {
        format!("slack messages in {}", self.channel_id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<SlackMessage>, ProviderError> {
        self.api
            .channel_history(self.token, self.channel_id, &self.oldest, cursor, limit)
            .await
    }

    fn map(&self, message: SlackMessage) -> Result<EventRow, &'static str> {
        let ts = message.ts.ok_or("message with no ts")?;
        let occurred_at = slack_ts_to_datetime(&ts).ok_or("unparseable ts")?;
        let action = message.subtype.clone().unwrap_or_else(|| "posted".to_string());
        Ok(EventRow {
            external_id: format!("slack:{}:{}:{}", self.team_id, self.channel_id, ts),
            kind: "message".to_string(),
            action: Some(action),
            target_external_id: Some(self.channel_id.to_string()),
            actor_external_id: message.user.clone(),
            payload: json!({
                "type": "message",
                "channel": self.channel_id,
                "user": message.user,
                "text": message.text,
                "ts": ts,
                "event_ts": ts,
                "thread_ts": message.thread_ts,
                "client_msg_id": message.client_msg_id,
                "team": message.team.unwrap_or_else(|| self.team_id.to_string()),
                "subtype": message.subtype,
                "reply_count": message.reply_count,
                "blocks": message.blocks,
                "attachments": message.attachments,
                "files": message.files,
            }),
            occurred_at,
        })
    }

    fn lower_bound(&self) -> Option<DateTime<Utc>> {
        Some(self.bound)
    }
}

pub struct SlackSync<A> {
    api: A,
    listing_page_size: usize,
    history_page_size: usize,
}

impl<A: SlackApi> SlackSync<A> {
    pub fn new(api: A, config: &PulseConfig) -> Self {
        Self {
            api,
            listing_page_size: config.page_size(Provider::Slack, LISTING_MAX).min(LISTING_MAX),
            history_page_size: config.page_size(Provider::Slack, HISTORY_MAX),
        }
    }

    async fn sync_messages(&self, ctx: &StepContext<'_>) -> Result<AdapterReport, SyncError> {
        let integration = ctx.integration;
        let team_id = integration
            .external_account_id
            .as_deref()
            .ok_or_else(|| SyncError::Config("Slack integration has no team id".to_string()))?;
        let channels = ctx
            .store
            .list_targets(integration.id, Some(TargetKind::Channel))
            .await?;
        info!("Scanning history in {} Slack channels", channels.len());

        let oldest = slack_ts_from_datetime(ctx.min_event_at);
        let mut report = AdapterReport::default();
        let mut seen = HashSet::new();
        for channel in &channels {
            let strategy = ChannelHistory {
                api: &self.api,
                token: &integration.credential,
                team_id,
                channel_id: &channel.external_id,
                oldest: oldest.clone(),
                bound: ctx.min_event_at,
                page_size: self.history_page_size,
            };
            let result = run_adapter(ctx.store, integration.id, &strategy, ctx.max_pages, &mut seen).await;
            report.absorb_container(&format!("slack channel #{}", channel.name), result)?;
        }
        Ok(report)
    }
}

#[async_trait]
impl<A: SlackApi> ProviderSync for SlackSync<A> {
    fn provider(&self) -> Provider {
        Provider::Slack
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, ctx: &StepContext<'_>, step: &str) -> Result<AdapterReport, SyncError> {
        let integration = ctx.integration;
        match step {
            "channels" => {
                let strategy = ChannelListing {
                    api: &self.api,
                    token: &integration.credential,
                    page_size: self.listing_page_size,
                };
                run_adapter(ctx.store, integration.id, &strategy, ctx.max_pages, &mut HashSet::new()).await
            }
            "users" => {
                let strategy = UserListing {
                    api: &self.api,
                    token: &integration.credential,
                    page_size: self.listing_page_size,
                };
                run_adapter(ctx.store, integration.id, &strategy, ctx.max_pages, &mut HashSet::new()).await
            }
            "messages" => self.sync_messages(ctx).await,
            other => Err(unknown_step(Provider::Slack, other)),
        }
    }
}
