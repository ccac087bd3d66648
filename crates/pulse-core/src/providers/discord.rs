//! Discord provider.
//!
//! Servers (guilds) are registered when the integration is connected; each
//! sync walks the locally known servers for channels and members, then every
//! known channel for recent messages.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_store::{EventRow, Provider, ReconcileScope, TargetKind, TargetRow, UserRow};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{call_with_backoff, decode_json, endpoint_url, unknown_step, Page, ProviderSync, StepContext};
use crate::config::PulseConfig;
use crate::error::{ProviderError, SyncError};
use crate::sync::{run_adapter, AdapterReport, SyncStrategy};

const PROVIDER: &str = "discord";
const STEPS: &[&str] = &["channels", "users", "messages"];
const MEMBERS_MAX: usize = 1000;
const MESSAGES_MAX: usize = 100;
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;
const CDN_BASE: &str = "https://cdn.discordapp.com";

/// Guild channel types kept by the channels step: `0` (GUILD_TEXT) and `2` (GUILD_VOICE).
/// Categories (4), announcement channels (5), threads (10-12), stage channels (13)
/// and forums (15) are dropped.
const SYNCED_CHANNEL_TYPES: [u8; 2] = [0, 2];

/// Credential used for a Discord call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscordAuth {
    Bot(String),
    /// OAuth access token of the installing user.
    Bearer(String),
}

impl DiscordAuth {
    fn header(&self) -> String {
        match self {
            DiscordAuth::Bot(token) => format!("Bot {}", token),
            DiscordAuth::Bearer(token) => format!("Bearer {}", token),
        }
    }
}

#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn guild_channels(&self, auth: &DiscordAuth, guild_id: &str) -> Result<Vec<DiscordChannel>, ProviderError>;

    /// Members ordered by user id, starting after `after`.
    async fn guild_members(
        &self,
        auth: &DiscordAuth,
        guild_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiscordMember>, ProviderError>;

    /// Messages with an id greater than `after`.
    async fn channel_messages(
        &self,
        auth: &DiscordAuth,
        channel_id: &str,
        after: &str,
        limit: usize,
    ) -> Result<Vec<DiscordMessage>, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannel {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
    pub guild_id: Option<String>,
    pub name: Option<String>,
    pub position: Option<i64>,
    pub parent_id: Option<String>,
    pub topic: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: Option<String>,
    pub global_name: Option<String>,
    pub avatar: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMember {
    pub user: Option<DiscordUser>,
    pub nick: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordMessage {
    pub id: Option<String>,
    pub channel_id: Option<String>,
    pub author: Option<DiscordUser>,
    pub timestamp: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub content: String,
    pub thread_id: Option<String>,
    pub edited_timestamp: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub mentions: Vec<serde_json::Value>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
}

/// Smallest snowflake minted at `at`; `after=` this id lists messages newer than `at`.
pub fn snowflake_after(at: DateTime<Utc>) -> String {
    let ms = (at.timestamp_millis() - DISCORD_EPOCH_MS).max(0);
    ((ms as u64) << 22).to_string()
}

fn avatar_url(user: &DiscordUser) -> Option<String> {
    user.avatar
        .as_ref()
        .map(|hash| format!("{}/avatars/{}/{}.png", CDN_BASE, user.id, hash))
}

/// Discord REST API v10 over reqwest.
pub struct HttpDiscordApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDiscordApi {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        auth: &DiscordAuth,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = endpoint_url(&self.base_url, path);
        let header = auth.header();
        let response = call_with_backoff(PROVIDER, || {
            self.http
                .get(&url)
                .header("Authorization", header.as_str())
                .query(params)
        })
        .await?;
        decode_json(PROVIDER, path, response).await
    }
}

#[async_trait]
impl DiscordApi for HttpDiscordApi {
    async fn guild_channels(&self, auth: &DiscordAuth, guild_id: &str) -> Result<Vec<DiscordChannel>, ProviderError> {
        self.get(auth, &format!("guilds/{}/channels", guild_id), &[]).await
    }

    async fn guild_members(
        &self,
        auth: &DiscordAuth,
        guild_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiscordMember>, ProviderError> {
        let mut params = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            params.push(("after", after.to_string()));
        }
        self.get(auth, &format!("guilds/{}/members", guild_id), &params).await
    }

    async fn channel_messages(
        &self,
        auth: &DiscordAuth,
        channel_id: &str,
        after: &str,
        limit: usize,
    ) -> Result<Vec<DiscordMessage>, ProviderError> {
        let params = [("limit", limit.to_string()), ("after", after.to_string())];
        self.get(auth, &format!("channels/{}/messages", channel_id), &params).await
    }
}

struct GuildChannels<'a, A> {
    api: &'a A,
    auth: &'a DiscordAuth,
    guild_id: &'a str,
}

#[async_trait]
impl<'a, A: DiscordApi> SyncStrategy for GuildChannels<'a, A> {
    type Record = DiscordChannel;
    type Row = TargetRow;

    fn entity(&self) -> String {
        format!("discord channels in guild {}", self.guild_id)
    }

    // The endpoint is not paginated.
    fn page_size(&self) -> usize {
        0
    }

    async fn fetch_page(&self, _cursor: Option<&str>, _limit: usize) -> Result<Page<DiscordChannel>, ProviderError> {
        Ok(Page::last(self.api.guild_channels(self.auth, self.guild_id).await?))
    }

    fn map(&self, channel: DiscordChannel) -> Result<TargetRow, &'static str> {
        let id = channel.id.ok_or("channel with no id")?;
        if !SYNCED_CHANNEL_TYPES.contains(&channel.kind) {
            return Err("unsupported channel type");
        }
        Ok(TargetRow {
            kind: TargetKind::Channel,
            external_id: id,
            parent_external_id: Some(self.guild_id.to_string()),
            name: channel.name.unwrap_or_else(|| "Unknown".to_string()),
            metadata: json!({
                "type": channel.kind,
                "guild_id": channel.guild_id.unwrap_or_else(|| self.guild_id.to_string()),
                "position": channel.position,
                "parent_id": channel.parent_id,
                "topic": channel.topic,
                "nsfw": channel.nsfw,
            }),
        })
    }

    fn reconcile_scope(&self) -> Option<ReconcileScope> {
        Some(ReconcileScope::child_of(TargetKind::Channel, self.guild_id))
    }
}

struct GuildMembers<'a, A> {
    api: &'a A,
    auth: &'a DiscordAuth,
    guild_id: &'a str,
    page_size: usize,
}

#[async_trait]
impl<'a, A: DiscordApi> SyncStrategy for GuildMembers<'a, A> {
    type Record = DiscordMember;
    type Row = UserRow;

    fn entity(&self) -> String {
        format!("discord members in guild {}", self.guild_id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<DiscordMember>, ProviderError> {
        let members = self.api.guild_members(self.auth, self.guild_id, cursor, limit).await?;
        // A full page means there may be more; continue after the last user id.
        let next = if members.len() == limit {
            members.last().and_then(|m| m.user.as_ref()).map(|u| u.id.clone())
        } else {
            None
        };
        Ok(Page::with_cursor(members, next))
    }

    fn map(&self, member: DiscordMember) -> Result<UserRow, &'static str> {
        let user = member.user.ok_or("member with no user")?;
        let username = user.username.clone().ok_or("user with no username")?;
        Ok(UserRow {
            avatar_url: avatar_url(&user),
            external_user_id: user.id,
            username,
            display_name: user.global_name.or(member.nick),
            email: user.email,
            is_bot: user.bot,
            ..Default::default()
        })
    }
}

struct ChannelMessages<'a, A> {
    api: &'a A,
    auth: &'a DiscordAuth,
    guild_id: &'a str,
    channel_id: &'a str,
    start_after: String,
    bound: DateTime<Utc>,
    page_size: usize,
}

#[async_trait]
impl<'a, A: DiscordApi> SyncStrategy for ChannelMessages<'a, A> {
    type Record = DiscordMessage;
    type Row = EventRow;

    fn entity(&self) -> String {
        format!("discord messages in {}", self.channel_id)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<DiscordMessage>, ProviderError> {
        let after = cursor.unwrap_or(&self.start_after);
        let messages = self.api.channel_messages(self.auth, self.channel_id, after, limit).await?;
        let next = if messages.len() == limit {
            messages
                .iter()
                .filter_map(|m| m.id.as_deref().and_then(|id| id.parse::<u64>().ok()))
                .max()
                .map(|id| id.to_string())
        } else {
            None
        };
        Ok(Page::with_cursor(messages, next))
    }

    fn map(&self, message: DiscordMessage) -> Result<EventRow, &'static str> {
        let id = message.id.ok_or("message with no id")?;
        let timestamp = message.timestamp.ok_or("message with no timestamp")?;
        let occurred_at = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|_| "unparseable timestamp")?
            .with_timezone(&Utc);
        let author = message.author.as_ref();
        Ok(EventRow {
            external_id: format!("message_{}", id),
            kind: "message".to_string(),
            action: Some("create".to_string()),
            target_external_id: Some(self.channel_id.to_string()),
            actor_external_id: author.map(|a| a.id.clone()),
            payload: json!({
                "id": id,
                "type": message.kind,
                "channel_id": message.channel_id.unwrap_or_else(|| self.channel_id.to_string()),
                "guild_id": self.guild_id,
                "content": message.content,
                "timestamp": timestamp,
                "edited_timestamp": message.edited_timestamp,
                "thread_id": message.thread_id,
                "pinned": message.pinned,
                "author": author.map(|a| json!({
                    "id": a.id,
                    "username": a.username,
                    "global_name": a.global_name,
                })),
                "mentions": message.mentions,
                "attachments": message.attachments,
                "embeds": message.embeds,
            }),
            occurred_at,
        })
    }

    fn lower_bound(&self) -> Option<DateTime<Utc>> {
        Some(self.bound)
    }
}

pub struct DiscordSync<A> {
    api: A,
    members_page_size: usize,
    messages_page_size: usize,
}

impl<A: DiscordApi> DiscordSync<A> {
    pub fn new(api: A, config: &PulseConfig) -> Self {
        Self {
            api,
            members_page_size: config.page_size(Provider::Discord, MEMBERS_MAX),
            messages_page_size: config.page_size(Provider::Discord, MESSAGES_MAX).min(MESSAGES_MAX),
        }
    }

    async fn sync_channels(&self, ctx: &StepContext<'_>) -> Result<AdapterReport, SyncError> {
        let auth = DiscordAuth::Bot(ctx.integration.credential.clone());
        let servers = ctx.store.list_targets(ctx.integration.id, Some(TargetKind::Server)).await?;
        info!("Syncing channels for {} Discord servers", servers.len());

        let mut report = AdapterReport::default();
        for server in &servers {
            let strategy = GuildChannels {
                api: &self.api,
                auth: &auth,
                guild_id: &server.external_id,
            };
            let result = run_adapter(ctx.store, ctx.integration.id, &strategy, ctx.max_pages, &mut HashSet::new()).await;
            report.absorb_container(&format!("discord server {}", server.name), result)?;
        }
        Ok(report)
    }

    async fn sync_users(&self, ctx: &StepContext<'_>) -> Result<AdapterReport, SyncError> {
        let auth = DiscordAuth::Bot(ctx.integration.credential.clone());
        let servers = ctx.store.list_targets(ctx.integration.id, Some(TargetKind::Server)).await?;

        let mut report = AdapterReport::default();
        let mut seen = HashSet::new();
        for server in &servers {
            let strategy = GuildMembers {
                api: &self.api,
                auth: &auth,
                guild_id: &server.external_id,
                page_size: self.members_page_size,
            };
            let result = run_adapter(ctx.store, ctx.integration.id, &strategy, ctx.max_pages, &mut seen).await;
            report.absorb_container(&format!("discord server {}", server.name), result)?;
        }
        info!("Discord user sync processed {} unique users", seen.len());
        Ok(report)
    }

    async fn sync_messages(&self, ctx: &StepContext<'_>) -> Result<AdapterReport, SyncError> {
        let auth = match ctx.store.installer_token(ctx.integration.id).await? {
            Some(token) => {
                debug!("Using installer OAuth token for Discord messages");
                DiscordAuth::Bearer(token)
            }
            None => DiscordAuth::Bot(ctx.integration.credential.clone()),
        };
        let channels = ctx.store.list_targets(ctx.integration.id, Some(TargetKind::Channel)).await?;
        let start_after = snowflake_after(ctx.min_event_at);

        let mut report = AdapterReport::default();
        let mut seen = HashSet::new();
        for channel in &channels {
            let Some(guild_id) = channel.parent_external_id.as_deref() else {
                debug!("Channel {} has no server, skipping", channel.external_id);
                continue;
            };
            let strategy = ChannelMessages {
                api: &self.api,
                auth: &auth,
                guild_id,
                channel_id: &channel.external_id,
                start_after: start_after.clone(),
                bound: ctx.min_event_at,
                page_size: self.messages_page_size,
            };
            let result = run_adapter(ctx.store, ctx.integration.id, &strategy, ctx.max_pages, &mut seen).await;
            report.absorb_container(&format!("discord channel #{}", channel.name), result)?;
        }
        Ok(report)
    }
}

#[async_trait]
impl<A: DiscordApi> ProviderSync for DiscordSync<A> {
    fn provider(&self) -> Provider {
        Provider::Discord
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, ctx: &StepContext<'_>, step: &str) -> Result<AdapterReport, SyncError> {
        match step {
            "channels" => self.sync_channels(ctx).await,
            "users" => self.sync_users(ctx).await,
            "messages" => self.sync_messages(ctx).await,
            other => Err(unknown_step(Provider::Discord, other)),
        }
    }
}
