//! Linear provider over the GraphQL API.
//!
//! Teams and projects are exhaustive listings and get reconciled. Issues
//! created since the lower bound become one `issue/sync` event each, keyed
//! `{issue id}-sync` so re-syncs refresh the same event.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pulse_store::{EventRow, Provider, ReconcileScope, TargetKind, TargetRow, UserRow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{call_with_backoff, decode_json, unknown_step, Page, ProviderSync, StepContext};
use crate::config::PulseConfig;
use crate::error::{ProviderError, SyncError};
use crate::sync::{run_adapter, AdapterReport, SyncStrategy};

const PROVIDER: &str = "linear";
const STEPS: &[&str] = &["teams", "users", "projects", "issues"];
const PAGE_MAX: usize = 200;

const TEAMS_QUERY: &str = r#"query Teams($first: Int!, $after: String) {
  teams(first: $first, after: $after) {
    nodes { id name key description private }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const USERS_QUERY: &str = r#"query Users($first: Int!, $after: String) {
  users(first: $first, after: $after, includeArchived: false) {
    nodes { id name displayName email avatarUrl active admin guest }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const PROJECTS_QUERY: &str = r#"query Projects($first: Int!, $after: String) {
  projects(first: $first, after: $after, includeArchived: false) {
    nodes { id name slugId description state url teams { nodes { id } } lead { id } }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const ISSUES_QUERY: &str = r#"query Issues($first: Int!, $after: String, $createdAfter: DateTimeOrDuration!) {
  issues(first: $first, after: $after, includeArchived: false, filter: { createdAt: { gte: $createdAfter } }) {
    nodes {
      id identifier number title description priority priorityLabel url branchName
      createdAt updatedAt startedAt completedAt canceledAt dueDate
      state { name type }
      team { id name key }
      project { id name }
      assignee { id name }
      creator { id name }
      parent { id }
      labels { nodes { name } }
    }
    pageInfo { hasNextPage endCursor }
  }
}"#;

#[async_trait]
pub trait LinearApi: Send + Sync {
    async fn teams(&self, token: &str, after: Option<&str>, first: usize) -> Result<Page<LinearTeam>, ProviderError>;

    async fn users(&self, token: &str, after: Option<&str>, first: usize) -> Result<Page<LinearUser>, ProviderError>;

    async fn projects(&self, token: &str, after: Option<&str>, first: usize)
        -> Result<Page<LinearProject>, ProviderError>;

    /// Issues created at or after `created_after`.
    async fn issues(
        &self,
        token: &str,
        created_after: DateTime<Utc>,
        after: Option<&str>,
        first: usize,
    ) -> Result<Page<LinearIssue>, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearTeam {
    pub id: Option<String>,
    pub name: Option<String>,
    pub key: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearUser {
    pub id: Option<String>,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub guest: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nodes<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearProject {
    pub id: Option<String>,
    pub name: Option<String>,
    pub slug_id: Option<String>,
    pub description: Option<String>,
    pub state: Option<String>,
    pub url: Option<String>,
    pub teams: Option<Nodes<LinearRef>>,
    pub lead: Option<LinearRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearIssue {
    pub id: Option<String>,
    pub identifier: Option<String>,
    pub number: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<f64>,
    pub priority_label: Option<String>,
    pub url: Option<String>,
    pub branch_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub due_date: Option<String>,
    pub state: Option<Value>,
    pub team: Option<LinearRef>,
    pub project: Option<LinearRef>,
    pub assignee: Option<LinearRef>,
    pub creator: Option<LinearRef>,
    pub parent: Option<LinearRef>,
    pub labels: Option<Nodes<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    nodes: Vec<T>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<HashMap<String, Connection<T>>>,
    errors: Option<Vec<GraphqlError>>,
}

/// Pull the single connection out of a GraphQL response body.
fn into_page<T>(field: &str, response: GraphqlResponse<T>) -> Result<Page<T>, ProviderError> {
    if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
        let message = errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; ");
        return Err(ProviderError::Rejected {
            provider: PROVIDER,
            endpoint: field.to_string(),
            message,
        });
    }
    let connection = response
        .data
        .and_then(|mut data| data.remove(field))
        .ok_or_else(|| ProviderError::Decode {
            provider: PROVIDER,
            endpoint: field.to_string(),
            message: format!("response has no {} connection", field),
        })?;
    let next = if connection.page_info.has_next_page {
        connection.page_info.end_cursor
    } else {
        None
    };
    Ok(Page::with_cursor(connection.nodes, next))
}

/// Linear GraphQL endpoint over reqwest.
pub struct HttpLinearApi {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLinearApi {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    async fn connection<T: DeserializeOwned>(
        &self,
        token: &str,
        field: &str,
        query: &str,
        variables: Value,
    ) -> Result<Page<T>, ProviderError> {
        let body = json!({ "query": query, "variables": variables });
        let response = call_with_backoff(PROVIDER, || {
            self.http
                .post(&self.endpoint)
                .header("Authorization", token)
                .json(&body)
        })
        .await?;
        let payload: GraphqlResponse<T> = decode_json(PROVIDER, field, response).await?;
        into_page(field, payload)
    }
}

#[async_trait]
impl LinearApi for HttpLinearApi {
    async fn teams(&self, token: &str, after: Option<&str>, first: usize) -> Result<Page<LinearTeam>, ProviderError> {
        self.connection(token, "teams", TEAMS_QUERY, json!({ "first": first, "after": after }))
            .await
    }

    async fn users(&self, token: &str, after: Option<&str>, first: usize) -> Result<Page<LinearUser>, ProviderError> {
        self.connection(token, "users", USERS_QUERY, json!({ "first": first, "after": after }))
            .await
    }

    async fn projects(
        &self,
        token: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Page<LinearProject>, ProviderError> {
        self.connection(token, "projects", PROJECTS_QUERY, json!({ "first": first, "after": after }))
            .await
    }

    async fn issues(
        &self,
        token: &str,
        created_after: DateTime<Utc>,
        after: Option<&str>,
        first: usize,
    ) -> Result<Page<LinearIssue>, ProviderError> {
        let variables = json!({
            "first": first,
            "after": after,
            "createdAfter": created_after.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        self.connection(token, "issues", ISSUES_QUERY, variables).await
    }
}

/// Which listing a [`LinearListing`] walks.
#[derive(Debug, Clone, Copy)]
enum Listing {
    Teams,
    Projects,
}

struct LinearListing<'a, A> {
    api: &'a A,
    token: &'a str,
    listing: Listing,
    page_size: usize,
}

/// Teams and projects both land in `sync_targets`.
enum ListedTarget {
    Team(LinearTeam),
    Project(LinearProject),
}

#[async_trait]
impl<'a, A: LinearApi> SyncStrategy for LinearListing<'a, A> {
    type Record = ListedTarget;
    type Row = TargetRow;

    fn entity(&self) -> String {
        match self.listing {
            Listing::Teams => "linear teams".to_string(),
            Listing::Projects => "linear projects".to_string(),
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<ListedTarget>, ProviderError> {
        Ok(match self.listing {
            Listing::Teams => {
                let page = self.api.teams(self.token, cursor, limit).await?;
                Page::with_cursor(page.items.into_iter().map(ListedTarget::Team).collect(), page.next_cursor)
            }
            Listing::Projects => {
                let page = self.api.projects(self.token, cursor, limit).await?;
                Page::with_cursor(
                    page.items.into_iter().map(ListedTarget::Project).collect(),
                    page.next_cursor,
                )
            }
        })
    }

    fn map(&self, record: ListedTarget) -> Result<TargetRow, &'static str> {
        match record {
            ListedTarget::Team(team) => Ok(TargetRow {
                kind: TargetKind::Team,
                external_id: team.id.ok_or("team with no id")?,
                parent_external_id: None,
                name: team.name.ok_or("team with no name")?,
                metadata: json!({
                    "key": team.key,
                    "description": team.description,
                    "private": team.private,
                }),
            }),
            ListedTarget::Project(project) => {
                let team_ids: Vec<String> = project
                    .teams
                    .map(|t| t.nodes.into_iter().map(|r| r.id).collect())
                    .unwrap_or_default();
                Ok(TargetRow {
                    kind: TargetKind::Project,
                    external_id: project.id.ok_or("project with no id")?,
                    parent_external_id: team_ids.first().cloned(),
                    name: project.name.ok_or("project with no name")?,
                    metadata: json!({
                        "key": project.slug_id,
                        "description": project.description,
                        "state": project.state,
                        "url": project.url,
                        "team_ids": team_ids,
                        "lead_id": project.lead.map(|l| l.id),
                    }),
                })
            }
        }
    }

    fn reconcile_scope(&self) -> Option<ReconcileScope> {
        Some(match self.listing {
            Listing::Teams => ReconcileScope::kind(TargetKind::Team),
            Listing::Projects => ReconcileScope::kind(TargetKind::Project),
        })
    }
}

struct LinearUsers<'a, A> {
    api: &'a A,
    token: &'a str,
    page_size: usize,
}

#[async_trait]
impl<'a, A: LinearApi> SyncStrategy for LinearUsers<'a, A> {
    type Record = LinearUser;
    type Row = UserRow;

    fn entity(&self) -> String {
        "linear users".to_string()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<LinearUser>, ProviderError> {
        self.api.users(self.token, cursor, limit).await
    }

    fn map(&self, user: LinearUser) -> Result<UserRow, &'static str> {
        let id = user.id.ok_or("user with no id")?;
        let name = user.name.ok_or("user with no name")?;
        Ok(UserRow {
            external_user_id: id,
            username: user.display_name.clone().unwrap_or_else(|| name.clone()),
            display_name: Some(name),
            email: user.email,
            avatar_url: user.avatar_url,
            ..Default::default()
        })
    }
}

struct LinearIssues<'a, A> {
    api: &'a A,
    token: &'a str,
    bound: DateTime<Utc>,
    page_size: usize,
}

#[async_trait]
impl<'a, A: LinearApi> SyncStrategy for LinearIssues<'a, A> {
    type Record = LinearIssue;
    type Row = EventRow;

    fn entity(&self) -> String {
        "linear issues".to_string()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_page(&self, cursor: Option<&str>, limit: usize) -> Result<Page<LinearIssue>, ProviderError> {
        self.api.issues(self.token, self.bound, cursor, limit).await
    }

    fn map(&self, issue: LinearIssue) -> Result<EventRow, &'static str> {
        let id = issue.id.clone().ok_or("issue with no id")?;
        let occurred_at = issue.created_at.ok_or("issue with no createdAt")?;
        let actor = issue.assignee.as_ref().or(issue.creator.as_ref()).map(|u| u.id.clone());
        let target = issue.project.as_ref().or(issue.team.as_ref()).map(|t| t.id.clone());
        let payload = serde_json::to_value(&issue).map_err(|_| "unserializable issue")?;
        Ok(EventRow {
            external_id: format!("{}-sync", id),
            kind: "issue".to_string(),
            action: Some("sync".to_string()),
            target_external_id: target,
            actor_external_id: actor,
            payload,
            occurred_at,
        })
    }

    fn lower_bound(&self) -> Option<DateTime<Utc>> {
        Some(self.bound)
    }
}

pub struct LinearSync<A> {
    api: A,
    page_size: usize,
}

impl<A: LinearApi> LinearSync<A> {
    pub fn new(api: A, config: &PulseConfig) -> Self {
        Self {
            api,
            page_size: config.page_size(Provider::Linear, PAGE_MAX),
        }
    }
}

#[async_trait]
impl<A: LinearApi> ProviderSync for LinearSync<A> {
    fn provider(&self) -> Provider {
        Provider::Linear
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, ctx: &StepContext<'_>, step: &str) -> Result<AdapterReport, SyncError> {
        let token = ctx.integration.credential.as_str();
        let id = ctx.integration.id;
        let mut seen = HashSet::new();
        match step {
            "teams" | "projects" => {
                let listing = if step == "teams" { Listing::Teams } else { Listing::Projects };
                let strategy = LinearListing {
                    api: &self.api,
                    token,
                    listing,
                    page_size: self.page_size,
                };
                run_adapter(ctx.store, id, &strategy, ctx.max_pages, &mut seen).await
            }
            "users" => {
                let strategy = LinearUsers {
                    api: &self.api,
                    token,
                    page_size: self.page_size,
                };
                run_adapter(ctx.store, id, &strategy, ctx.max_pages, &mut seen).await
            }
            "issues" => {
                let strategy = LinearIssues {
                    api: &self.api,
                    token,
                    bound: ctx.min_event_at,
                    page_size: self.page_size,
                };
                run_adapter(ctx.store, id, &strategy, ctx.max_pages, &mut seen).await
            }
            other => Err(unknown_step(Provider::Linear, other)),
        }
    }
}
