//! GitHub provider.
//!
//! `external_account_id` on the integration is the organization login.
//! Repositories and members come from the org listings; events come from
//! each repository's public event feed, newest first.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_store::{EventRow, Provider, ReconcileScope, TargetKind, TargetRow, UserRow};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{call_with_backoff, decode_json, endpoint_url, unknown_step, Page, ProviderSync, StepContext};
use crate::config::PulseConfig;
use crate::error::{ProviderError, SyncError};
use crate::sync::{run_adapter, AdapterReport, SyncStrategy};

const PROVIDER: &str = "github";
const STEPS: &[&str] = &["repositories", "users", "events"];
const PER_PAGE_MAX: usize = 100;

#[async_trait]
pub trait GithubApi: Send + Sync {
    async fn org_repositories(
        &self,
        token: &str,
        org: &str,
        page: u32,
        per_page: usize,
    ) -> Result<Vec<GithubRepository>, ProviderError>;

    async fn org_members(&self, token: &str, org: &str, page: u32, per_page: usize)
        -> Result<Vec<GithubUser>, ProviderError>;

    /// Repository events, newest first.
    async fn repository_events(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: usize,
    ) -> Result<Vec<GithubEvent>, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRepository {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub owner: Option<GithubOwner>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub archived: bool,
    pub description: Option<String>,
    pub html_url: Option<String>,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub id: Option<u64>,
    pub login: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubEvent {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub actor: Option<GithubUser>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

/// `PullRequestReviewEvent` -> `pull_request_review`.
pub fn standardize_event_name(name: &str) -> String {
    let name = name.strip_suffix("Event").unwrap_or(name);
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// Page-numbered listings continue while pages come back full.
fn numbered_page<T>(items: Vec<T>, page: u32, per_page: usize) -> Page<T> {
    let next = (items.len() == per_page).then(|| (page + 1).to_string());
    Page::with_cursor(items, next)
}

fn page_number(cursor: Option<&str>) -> u32 {
    cursor.and_then(|c| c.parse().ok()).unwrap_or(1)
}

/// GitHub REST API over reqwest.
pub struct HttpGithubApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGithubApi {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        page: u32,
        per_page: usize,
    ) -> Result<T, ProviderError> {
        let url = endpoint_url(&self.base_url, path);
        let params = [("page", page.to_string()), ("per_page", per_page.to_string())];
        let response = call_with_backoff(PROVIDER, || {
            self.http
                .get(&url)
                .header("Authorization", format!("token {}", token))
                .header("Accept", "application/vnd.github+json")
                .query(&params)
        })
        .await?;
        decode_json(PROVIDER, path, response).await
    }
}

#[async_trait]
impl GithubApi for HttpGithubApi {
    async fn org_repositories(
        &self,
        token: &str,
        org: &str,
        page: u32,
        per_page: usize,
    ) -> Result<Vec<GithubRepository>, ProviderError> {
        self.get(token, &format!("orgs/{}/repos", org), page, per_page).await
    }

    async fn org_members(
        &self,
        token: &str,
        org: &str,
        page: u32,
        per_page: usize,
    ) -> Result<Vec<GithubUser>, ProviderError> {
        self.get(token, &format!("orgs/{}/members", org), page, per_page).await
    }

    async fn repository_events(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: usize,
    ) -> Result<Vec<GithubEvent>, ProviderError> {
        self.get(token, &format!("repos/{}/{}/events", owner, repo), page, per_page)
            .await
    }
}

struct OrgRepositories<'a, A> {
    api: &'a A,
    token: &'a str,
    org: &'a str,
    per_page: usize,
}

#[async_trait]
impl<'a, A: GithubApi> SyncStrategy for OrgRepositories<'a, A> {
    type Record = GithubRepository;
    type Row = TargetRow;

    fn entity(&self) -> String {
        format!("github repositories of {}", self.org)
    }

    fn page_size(&self) -> usize {
        self.per_page
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<GithubRepository>, ProviderError> {
        let page = page_number(cursor);
        let repos = self.api.org_repositories(self.token, self.org, page, limit).await?;
        Ok(numbered_page(repos, page, limit))
    }

    fn map(&self, repo: GithubRepository) -> Result<TargetRow, &'static str> {
        let id = repo.id.ok_or("repository with no id")?;
        let name = repo.name.ok_or("repository with no name")?;
        let owner = repo
            .owner
            .map(|o| o.login)
            .unwrap_or_else(|| self.org.to_string());
        Ok(TargetRow {
            kind: TargetKind::Repository,
            external_id: id.to_string(),
            parent_external_id: None,
            name: repo.full_name.unwrap_or_else(|| format!("{}/{}", owner, name)),
            metadata: json!({
                "owner": owner,
                "name": name,
                "private": repo.private,
                "archived": repo.archived,
                "description": repo.description,
                "html_url": repo.html_url,
                "default_branch": repo.default_branch,
            }),
        })
    }

    fn reconcile_scope(&self) -> Option<ReconcileScope> {
        Some(ReconcileScope::kind(TargetKind::Repository))
    }
}

struct OrgMembers<'a, A> {
    api: &'a A,
    token: &'a str,
    org: &'a str,
    per_page: usize,
}

#[async_trait]
impl<'a, A: GithubApi> SyncStrategy for OrgMembers<'a, A> {
    type Record = GithubUser;
    type Row = UserRow;

    fn entity(&self) -> String {
        format!("github members of {}", self.org)
    }

    fn page_size(&self) -> usize {
        self.per_page
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<GithubUser>, ProviderError> {
        let page = page_number(cursor);
        let members = self.api.org_members(self.token, self.org, page, limit).await?;
        Ok(numbered_page(members, page, limit))
    }

    fn map(&self, user: GithubUser) -> Result<UserRow, &'static str> {
        let id = user.id.ok_or("user with no id")?;
        let login = user.login.ok_or("user with no login")?;
        Ok(UserRow {
            external_user_id: id.to_string(),
            username: login,
            display_name: user.name,
            email: user.email,
            avatar_url: user.avatar_url,
            is_bot: user.kind.as_deref() == Some("Bot"),
            ..Default::default()
        })
    }
}

struct RepositoryEvents<'a, A> {
    api: &'a A,
    token: &'a str,
    repository_id: &'a str,
    owner: &'a str,
    repo: &'a str,
    bound: DateTime<Utc>,
    per_page: usize,
}

#[async_trait]
impl<'a, A: GithubApi> SyncStrategy for RepositoryEvents<'a, A> {
    type Record = GithubEvent;
    type Row = EventRow;

    fn entity(&self) -> String {
        format!("github events of {}/{}", self.owner, self.repo)
    }

    fn page_size(&self) -> usize {
        self.per_page
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<GithubEvent>, ProviderError> {
        let page = page_number(cursor);
        let events = self
            .api
            .repository_events(self.token, self.owner, self.repo, page, limit)
            .await?;
        Ok(numbered_page(events, page, limit))
    }

    fn map(&self, event: GithubEvent) -> Result<EventRow, &'static str> {
        let id = event.id.ok_or("event with no id")?;
        let occurred_at = event.created_at.ok_or("event with no created_at")?;
        let kind = standardize_event_name(event.kind.as_deref().unwrap_or("UnknownEvent"));
        let action = event
            .payload
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(EventRow {
            external_id: id,
            kind,
            action,
            target_external_id: Some(self.repository_id.to_string()),
            actor_external_id: event.actor.and_then(|a| a.id).map(|id| id.to_string()),
            payload: event.payload,
            occurred_at,
        })
    }

    fn lower_bound(&self) -> Option<DateTime<Utc>> {
        Some(self.bound)
    }

    fn stops_at_lower_bound(&self) -> bool {
        true
    }
}

pub struct GithubSync<A> {
    api: A,
    per_page: usize,
}

impl<A: GithubApi> GithubSync<A> {
    pub fn new(api: A, config: &PulseConfig) -> Self {
        Self {
            api,
            per_page: config.page_size(Provider::Github, PER_PAGE_MAX),
        }
    }

    async fn sync_events(&self, ctx: &StepContext<'_>) -> Result<AdapterReport, SyncError> {
        let integration = ctx.integration;
        let repositories = ctx
            .store
            .list_targets(integration.id, Some(TargetKind::Repository))
            .await?;
        info!("Fetching events for {} GitHub repositories", repositories.len());

        let mut report = AdapterReport::default();
        let mut seen = HashSet::new();
        for repository in &repositories {
            let owner = repository.metadata.get("owner").and_then(Value::as_str);
            let name = repository.metadata.get("name").and_then(Value::as_str);
            let (Some(owner), Some(name)) = (owner, name) else {
                report.skipped.push(repository.name.clone());
                continue;
            };
            let strategy = RepositoryEvents {
                api: &self.api,
                token: &integration.credential,
                repository_id: &repository.external_id,
                owner,
                repo: name,
                bound: ctx.min_event_at,
                per_page: self.per_page,
            };
            let result = run_adapter(ctx.store, integration.id, &strategy, ctx.max_pages, &mut seen).await;
            report.absorb_container(&format!("github repository {}", repository.name), result)?;
        }
        Ok(report)
    }
}

fn org_login<'a>(ctx: &'a StepContext<'_>) -> Result<&'a str, SyncError> {
    ctx.integration
        .external_account_id
        .as_deref()
        .ok_or_else(|| SyncError::Config("GitHub integration has no organization login".to_string()))
}

#[async_trait]
impl<A: GithubApi> ProviderSync for GithubSync<A> {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, ctx: &StepContext<'_>, step: &str) -> Result<AdapterReport, SyncError> {
        let token = ctx.integration.credential.as_str();
        match step {
            "repositories" => {
                let strategy = OrgRepositories {
                    api: &self.api,
                    token,
                    org: org_login(ctx)?,
                    per_page: self.per_page,
                };
                run_adapter(ctx.store, ctx.integration.id, &strategy, ctx.max_pages, &mut HashSet::new()).await
            }
            "users" => {
                let strategy = OrgMembers {
                    api: &self.api,
                    token,
                    org: org_login(ctx)?,
                    per_page: self.per_page,
                };
                run_adapter(ctx.store, ctx.integration.id, &strategy, ctx.max_pages, &mut HashSet::new()).await
            }
            "events" => self.sync_events(ctx).await,
            other => Err(unknown_step(Provider::Github, other)),
        }
    }
}
