//! Read-side tools handed to the model.
//!
//! Each provider gets five tools: list events, event detail, user lookup,
//! target lookup and integration details. The status tools read stored status
//! updates. Arguments are typed and validated before any query runs; a bad
//! call produces a JSON error for the model, never an `Err` for the caller.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use pulse_store::{EventFilter, Provider, StatusUpdateFilter, Store, TargetKind};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::llm::{ToolCall, ToolDefinition};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("lookup failed: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentTool {
    ListEvents(Provider),
    EventDetail(Provider),
    User(Provider),
    Target(Provider),
    Integration(Provider),
    /// Items the member already has for the requested window.
    ExistingStatusItems,
    /// Published status updates of the members in scope.
    StatusUpdates,
}

const STATUS_TOOLS: [AgentTool; 2] = [AgentTool::ExistingStatusItems, AgentTool::StatusUpdates];

fn label(provider: Provider) -> &'static str {
    match provider {
        Provider::Slack => "Slack",
        Provider::Discord => "Discord",
        Provider::Linear => "Linear",
        Provider::Github => "GitHub",
    }
}

fn target_noun(provider: Provider) -> &'static str {
    match provider {
        Provider::Slack | Provider::Discord => "channel",
        Provider::Linear => "team or project",
        Provider::Github => "repository",
    }
}

fn window_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "effectiveFrom": { "type": "string", "description": "RFC 3339 start (inclusive)" },
            "effectiveTo": { "type": "string", "description": "RFC 3339 end (inclusive)" }
        },
        "required": ["effectiveFrom", "effectiveTo"],
        "additionalProperties": false
    })
}

impl AgentTool {
    pub fn for_provider(provider: Provider) -> [AgentTool; 5] {
        [
            AgentTool::ListEvents(provider),
            AgentTool::EventDetail(provider),
            AgentTool::User(provider),
            AgentTool::Target(provider),
            AgentTool::Integration(provider),
        ]
    }

    pub fn provider(&self) -> Option<Provider> {
        match *self {
            AgentTool::ListEvents(p)
            | AgentTool::EventDetail(p)
            | AgentTool::User(p)
            | AgentTool::Target(p)
            | AgentTool::Integration(p) => Some(p),
            AgentTool::ExistingStatusItems | AgentTool::StatusUpdates => None,
        }
    }

    pub fn name(&self) -> String {
        match *self {
            AgentTool::ListEvents(p) => format!("list{}Events", label(p)),
            AgentTool::EventDetail(p) => format!("get{}EventDetail", label(p)),
            AgentTool::User(p) => format!("get{}User", label(p)),
            AgentTool::Target(p) => format!("get{}Target", label(p)),
            AgentTool::Integration(p) => format!("get{}Integration", label(p)),
            AgentTool::ExistingStatusItems => "getExistingStatusUpdateItems".to_string(),
            AgentTool::StatusUpdates => "listStatusUpdates".to_string(),
        }
    }

    pub fn parse(name: &str) -> Option<AgentTool> {
        Provider::ALL
            .into_iter()
            .flat_map(AgentTool::for_provider)
            .chain(STATUS_TOOLS)
            .find(|tool| tool.name() == name)
    }

    pub fn definition(&self) -> ToolDefinition {
        let (description, parameters) = match *self {
            AgentTool::ListEvents(p) => (
                format!(
                    "List {} events between effectiveFrom and effectiveTo, newest first. \
                     Returns eventId, kind, action, occurredAt, a short summary and the resolved \
                     actor and target names. Call this first.",
                    label(p)
                ),
                json!({
                    "type": "object",
                    "properties": {
                        "effectiveFrom": { "type": "string", "description": "RFC 3339 start (inclusive)" },
                        "effectiveTo": { "type": "string", "description": "RFC 3339 end (inclusive)" },
                        "actorId": { "type": "string", "description": "Only events by this user id" },
                        "targetIds": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": format!("Only events in these {} ids", target_noun(p))
                        }
                    },
                    "required": ["effectiveFrom", "effectiveTo"],
                    "additionalProperties": false
                }),
            ),
            AgentTool::EventDetail(p) => (
                format!("Fetch one {} event with its full payload.", label(p)),
                json!({
                    "type": "object",
                    "properties": { "eventId": { "type": "integer" } },
                    "required": ["eventId"],
                    "additionalProperties": false
                }),
            ),
            AgentTool::User(p) => (
                format!("Resolve a {} user id to a name. Use before naming anyone.", label(p)),
                json!({
                    "type": "object",
                    "properties": { "userId": { "type": "string" } },
                    "required": ["userId"],
                    "additionalProperties": false
                }),
            ),
            AgentTool::Target(p) => (
                format!("Resolve a {} {} id to its name and details.", label(p), target_noun(p)),
                json!({
                    "type": "object",
                    "properties": { "targetId": { "type": "string" } },
                    "required": ["targetId"],
                    "additionalProperties": false
                }),
            ),
            AgentTool::Integration(p) => (
                if p == Provider::Discord {
                    "Discord integration details: account, sync state and the synced servers.".to_string()
                } else {
                    format!("{} integration details: account id and sync state.", label(p))
                },
                json!({ "type": "object", "properties": {}, "additionalProperties": false }),
            ),
            AgentTool::ExistingStatusItems => (
                "Status update items already written for this member for exactly effectiveFrom to \
                 effectiveTo. Call this first and build on them."
                    .to_string(),
                window_parameters(),
            ),
            AgentTool::StatusUpdates => (
                "List published status updates with their items, mood and notes between \
                 effectiveFrom and effectiveTo, grouped by member."
                    .to_string(),
                window_parameters(),
            ),
        };
        ToolDefinition {
            name: self.name(),
            description,
            parameters,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ListEventsArgs {
    effective_from: String,
    effective_to: String,
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    target_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct WindowArgs {
    effective_from: String,
    effective_to: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct EventDetailArgs {
    event_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct UserArgs {
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct TargetArgs {
    target_id: String,
}

fn parse_args<T: DeserializeOwned>(raw: &str) -> Result<T, ToolError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn parse_date(field: &str, value: &str) -> Result<DateTime<Utc>, ToolError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ToolError::InvalidArguments(format!("{field} must be an RFC 3339 timestamp")))
}

fn parse_window(from: &str, to: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), ToolError> {
    let from = parse_date("effectiveFrom", from)?;
    let to = parse_date("effectiveTo", to)?;
    if from > to {
        return Err(ToolError::InvalidArguments(
            "effectiveFrom must not be after effectiveTo".to_string(),
        ));
    }
    Ok((from, to))
}

fn non_empty(field: &str, value: Option<String>) -> Result<Option<String>, ToolError> {
    match value {
        Some(v) if v.trim().is_empty() => Err(ToolError::InvalidArguments(format!("{field} must not be empty"))),
        other => Ok(other),
    }
}

/// Requested targets narrowed to the allowed ones. `None` when the request
/// names only targets outside the allowed set.
fn narrow_targets(allowed: &[String], requested: Vec<String>) -> Option<Vec<String>> {
    if allowed.is_empty() {
        return Some(requested);
    }
    if requested.is_empty() {
        return Some(allowed.to_vec());
    }
    let kept: Vec<String> = requested.into_iter().filter(|t| allowed.contains(t)).collect();
    (!kept.is_empty()).then_some(kept)
}

/// Whose data the tools may read.
#[derive(Debug, Clone, Default)]
pub struct ToolScope {
    pub organization_id: String,
    /// When set, event listings only return this member's activity.
    pub member_id: Option<String>,
    /// When non-empty, event listings never leave these targets.
    pub target_ids: Vec<String>,
    /// When set, status update listings only cover this team's members.
    pub team_id: Option<String>,
}

pub struct ToolRuntime {
    store: Store,
    scope: ToolScope,
    tools: Vec<AgentTool>,
    page_limit: usize,
}

impl ToolRuntime {
    pub fn new(store: Store, scope: ToolScope, providers: &[Provider], page_limit: usize) -> Self {
        Self {
            store,
            scope,
            tools: providers.iter().copied().flat_map(AgentTool::for_provider).collect(),
            page_limit: page_limit.max(1),
        }
    }

    pub fn with_tool(mut self, tool: AgentTool) -> Self {
        if !self.tools.contains(&tool) {
            self.tools.push(tool);
        }
        self
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(AgentTool::definition).collect()
    }

    /// Run one call and render the result (or the error) as JSON text.
    pub async fn execute(&self, call: &ToolCall) -> String {
        debug!("Tool call {} {}", call.name, call.arguments);
        let result = match AgentTool::parse(&call.name).filter(|t| self.tools.contains(t)) {
            Some(tool) => self.run(tool, &call.arguments).await,
            None => Err(ToolError::UnknownTool(call.name.clone())),
        };
        match result {
            Ok(value) => value.to_string(),
            Err(e) => {
                if let ToolError::Store(inner) = &e {
                    warn!("Tool {} failed: {:#}", call.name, inner);
                }
                json!({ "error": e.to_string() }).to_string()
            }
        }
    }

    async fn run(&self, tool: AgentTool, arguments: &str) -> Result<Value, ToolError> {
        let org = self.scope.organization_id.as_str();
        match tool {
            AgentTool::ListEvents(provider) => {
                let args: ListEventsArgs = parse_args(arguments)?;
                self.list_events(provider, args).await
            }
            AgentTool::EventDetail(provider) => {
                let args: EventDetailArgs = parse_args(arguments)?;
                let detail = self
                    .store
                    .get_event_detail(org, provider, args.event_id)
                    .await?
                    .ok_or_else(|| ToolError::NotFound(format!("event {}", args.event_id)))?;
                Ok(serde_json::to_value(detail).map_err(|e| anyhow!(e))?)
            }
            AgentTool::User(provider) => {
                let args: UserArgs = parse_args(arguments)?;
                let user_id = non_empty("userId", Some(args.user_id))?.unwrap_or_default();
                let user = self
                    .store
                    .get_provider_user(org, provider, &user_id)
                    .await?
                    .ok_or_else(|| ToolError::NotFound(format!("user {}", user_id)))?;
                Ok(json!({
                    "userId": user.external_user_id,
                    "username": user.username,
                    "displayName": user.display_name,
                    "email": user.email,
                    "isBot": user.is_bot,
                }))
            }
            AgentTool::Target(provider) => {
                let args: TargetArgs = parse_args(arguments)?;
                let target_id = non_empty("targetId", Some(args.target_id))?.unwrap_or_default();
                let target = self
                    .store
                    .get_target(org, provider, &target_id)
                    .await?
                    .ok_or_else(|| ToolError::NotFound(format!("target {}", target_id)))?;
                Ok(json!({
                    "targetId": target.external_id,
                    "kind": target.kind.as_str(),
                    "name": target.name,
                    "parentId": target.parent_external_id,
                    "metadata": target.metadata,
                }))
            }
            AgentTool::Integration(provider) => {
                let _: NoArgs = parse_args(arguments)?;
                self.integration(provider).await
            }
            AgentTool::ExistingStatusItems => {
                let args: WindowArgs = parse_args(arguments)?;
                let (from, to) = parse_window(&args.effective_from, &args.effective_to)?;
                let member_id = self
                    .scope
                    .member_id
                    .as_deref()
                    .ok_or_else(|| ToolError::InvalidArguments("no member in scope".to_string()))?;
                let items = self.store.status_items(org, member_id, from, to).await?;
                Ok(json!({ "items": items }))
            }
            AgentTool::StatusUpdates => {
                let args: WindowArgs = parse_args(arguments)?;
                let (from, to) = parse_window(&args.effective_from, &args.effective_to)?;
                let updates = self
                    .store
                    .list_status_updates(&StatusUpdateFilter {
                        organization_id: self.scope.organization_id.clone(),
                        team_id: self.scope.team_id.clone(),
                        member_id: self.scope.member_id.clone(),
                        from,
                        to,
                    })
                    .await?;
                Ok(json!({ "statusUpdates": updates }))
            }
        }
    }

    /// Account and sync state only; the credential never leaves the store.
    async fn integration(&self, provider: Provider) -> Result<Value, ToolError> {
        let integration = self
            .store
            .list_integrations(Some(&self.scope.organization_id))
            .await?
            .into_iter()
            .find(|i| i.provider == provider)
            .ok_or_else(|| ToolError::NotFound(format!("{} integration", label(provider))))?;
        let mut out = json!({
            "provider": provider.as_str(),
            "accountId": integration.external_account_id,
            "syncing": integration.sync_id.is_some(),
            "lastSyncedAt": integration.sync_finished_at,
            "syncError": integration.sync_error,
        });
        if provider == Provider::Discord {
            let servers: Vec<Value> = self
                .store
                .list_targets(integration.id, Some(TargetKind::Server))
                .await?
                .into_iter()
                .map(|s| json!({ "serverId": s.external_id, "name": s.name }))
                .collect();
            out["servers"] = Value::Array(servers);
        }
        Ok(out)
    }

    async fn list_events(&self, provider: Provider, args: ListEventsArgs) -> Result<Value, ToolError> {
        let (from, to) = parse_window(&args.effective_from, &args.effective_to)?;
        let mut actor = non_empty("actorId", args.actor_id)?;
        if args.target_ids.iter().any(|t| t.trim().is_empty()) {
            return Err(ToolError::InvalidArguments("targetIds must not contain empty ids".to_string()));
        }
        let Some(targets) = narrow_targets(&self.scope.target_ids, args.target_ids) else {
            return Ok(json!({
                "events": [],
                "note": "requested targets are outside this summary's filter",
            }));
        };

        if let Some(member_id) = &self.scope.member_id {
            let identities = self
                .store
                .member_identities(&self.scope.organization_id, member_id)
                .await?;
            match identities.into_iter().find(|i| i.provider == provider) {
                Some(identity) => actor = Some(identity.external_user_id),
                None => {
                    return Ok(json!({
                        "events": [],
                        "note": format!("member has no linked {} account", label(provider)),
                    }))
                }
            }
        }

        let events = self
            .store
            .list_events(&EventFilter {
                organization_id: self.scope.organization_id.clone(),
                provider,
                from,
                to,
                actor_external_id: actor,
                target_external_ids: targets,
                limit: self.page_limit,
            })
            .await?;
        let truncated = events.len() == self.page_limit;
        Ok(json!({ "events": events, "truncated": truncated }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_store::{EventRow, MemberIdentity, NewIntegration, NewStatusItem, NewStatusUpdate, TargetRow, UserRow};

    async fn setup() -> Store {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Slack,
                credential: "xoxb".to_string(),
                external_account_id: Some("T1".to_string()),
            })
            .await
            .unwrap();
        let events: Vec<EventRow> = [("U1", "ship it", 10), ("U2", "review pls", 11)]
            .iter()
            .map(|(user, text, hour)| EventRow {
                external_id: format!("slack:T1:C1:{hour}"),
                kind: "message".to_string(),
                action: Some("posted".to_string()),
                target_external_id: Some("C1".to_string()),
                actor_external_id: Some(user.to_string()),
                payload: json!({ "text": text }),
                occurred_at: Utc.with_ymd_and_hms(2025, 3, 11, *hour, 0, 0).unwrap(),
            })
            .collect();
        store.apply_page(integration.id, &events).await.unwrap();
        store
            .apply_page(
                integration.id,
                &[UserRow {
                    external_user_id: "U1".to_string(),
                    username: "ada".to_string(),
                    display_name: Some("Ada".to_string()),
                    access_token: Some("secret".to_string()),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        store
    }

    fn runtime(store: Store, member_id: Option<&str>) -> ToolRuntime {
        ToolRuntime::new(
            store,
            ToolScope {
                organization_id: "org_1".to_string(),
                member_id: member_id.map(str::to_string),
                ..Default::default()
            },
            &[Provider::Slack, Provider::Github],
            200,
        )
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    async fn run(rt: &ToolRuntime, name: &str, arguments: Value) -> Value {
        serde_json::from_str(&rt.execute(&call(name, arguments)).await).unwrap()
    }

    const WEEK: (&str, &str) = ("2025-03-10T00:00:00Z", "2025-03-16T23:59:59Z");

    #[test]
    fn test_tool_names() {
        assert_eq!(AgentTool::ListEvents(Provider::Github).name(), "listGitHubEvents");
        assert_eq!(AgentTool::parse("getSlackTarget"), Some(AgentTool::Target(Provider::Slack)));
        assert_eq!(AgentTool::parse("getGitlabUser"), None);
        assert_eq!(AgentTool::parse("getDiscordIntegration"), Some(AgentTool::Integration(Provider::Discord)));
        assert_eq!(AgentTool::parse("getExistingStatusUpdateItems"), Some(AgentTool::ExistingStatusItems));
        assert_eq!(AgentTool::StatusUpdates.provider(), None);
    }

    #[tokio::test]
    async fn test_list_events_is_recency_ordered_without_payload() {
        let rt = runtime(setup().await, None);
        let out = run(&rt, "listSlackEvents", json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1 })).await;
        let events = out["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["summary"], "review pls");
        assert!(events[0].get("payload").is_none());
        assert_eq!(events[1]["actor"], "Ada");
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_reported_to_the_model() {
        let rt = runtime(setup().await, None);

        let out = run(&rt, "listSlackEvents", json!({ "effectiveFrom": WEEK.1, "effectiveTo": WEEK.0 })).await;
        assert!(out["error"].as_str().unwrap().contains("after"));

        let out = run(&rt, "listSlackEvents", json!({ "effectiveFrom": "last monday", "effectiveTo": WEEK.1 })).await;
        assert!(out["error"].as_str().unwrap().contains("RFC 3339"));

        let out = run(
            &rt,
            "listSlackEvents",
            json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1, "organizationId": "org_2" }),
        )
        .await;
        assert!(out["error"].as_str().unwrap().contains("unknown field"));

        let out = run(&rt, "getSlackUser", json!({ "userId": "  " })).await;
        assert!(out["error"].as_str().unwrap().contains("must not be empty"));

        let out = run(&rt, "getLinearUser", json!({ "userId": "U1" })).await;
        assert!(out["error"].as_str().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_lookups_stay_inside_the_organization() {
        let store = setup().await;
        let rt = runtime(store.clone(), None);
        let out = run(&rt, "getSlackUser", json!({ "userId": "U1" })).await;
        assert_eq!(out["displayName"], "Ada");
        assert!(out.get("accessToken").is_none());

        let other = ToolRuntime::new(
            store,
            ToolScope {
                organization_id: "org_2".to_string(),
                ..Default::default()
            },
            &[Provider::Slack],
            200,
        );
        let out = run(&other, "getSlackEventDetail", json!({ "eventId": 1 })).await;
        assert_eq!(out["error"], "event 1 not found");
    }

    #[tokio::test]
    async fn test_member_scoped_listing_uses_linked_identity() {
        let store = setup().await;
        store
            .link_member_identity(&MemberIdentity {
                organization_id: "org_1".to_string(),
                member_id: "mem_1".to_string(),
                provider: Provider::Slack,
                external_user_id: "U2".to_string(),
            })
            .await
            .unwrap();
        let rt = runtime(store, Some("mem_1"));

        let out = run(&rt, "listSlackEvents", json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1 })).await;
        let events = out["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["summary"], "review pls");

        let out = run(&rt, "listGitHubEvents", json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1 })).await;
        assert!(out["events"].as_array().unwrap().is_empty());
        assert!(out["note"].as_str().unwrap().contains("GitHub"));
    }

    #[tokio::test]
    async fn test_listing_never_leaves_scoped_targets() {
        let store = setup().await;
        let integration = store.list_integrations(Some("org_1")).await.unwrap().remove(0);
        store
            .apply_page(
                integration.id,
                &[EventRow {
                    external_id: "slack:T1:C2:12".to_string(),
                    kind: "message".to_string(),
                    action: Some("posted".to_string()),
                    target_external_id: Some("C2".to_string()),
                    actor_external_id: Some("U1".to_string()),
                    payload: json!({ "text": "off topic" }),
                    occurred_at: Utc.with_ymd_and_hms(2025, 3, 11, 12, 0, 0).unwrap(),
                }],
            )
            .await
            .unwrap();
        let window = json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1 });

        let open = runtime(store.clone(), None);
        assert_eq!(run(&open, "listSlackEvents", window.clone()).await["events"].as_array().unwrap().len(), 3);
        let out = run(
            &open,
            "listSlackEvents",
            json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1, "targetIds": ["C2"] }),
        )
        .await;
        assert_eq!(out["events"].as_array().unwrap().len(), 1);

        let scoped = ToolRuntime::new(
            store,
            ToolScope {
                organization_id: "org_1".to_string(),
                target_ids: vec!["C1".to_string()],
                ..Default::default()
            },
            &[Provider::Slack],
            200,
        );
        let out = run(&scoped, "listSlackEvents", window).await;
        let events = out["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["summary"] != "off topic"));

        let out = run(
            &scoped,
            "listSlackEvents",
            json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1, "targetIds": ["C2"] }),
        )
        .await;
        assert!(out["events"].as_array().unwrap().is_empty());
        assert!(out["note"].as_str().unwrap().contains("outside"));

        let out = run(
            &scoped,
            "listSlackEvents",
            json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1, "targetId": "C2" }),
        )
        .await;
        assert!(out["error"].as_str().unwrap().contains("unknown field"));
    }

    #[tokio::test]
    async fn test_integration_tool_reports_servers_without_credentials() {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Discord,
                credential: "bot-secret".to_string(),
                external_account_id: Some("app_1".to_string()),
            })
            .await
            .unwrap();
        store
            .apply_page(
                integration.id,
                &[TargetRow {
                    kind: TargetKind::Server,
                    external_id: "G1".to_string(),
                    parent_external_id: None,
                    name: "Acme".to_string(),
                    metadata: json!({}),
                }],
            )
            .await
            .unwrap();
        let rt = ToolRuntime::new(
            store,
            ToolScope {
                organization_id: "org_1".to_string(),
                ..Default::default()
            },
            &[Provider::Discord, Provider::Slack],
            200,
        );

        let raw = rt.execute(&call("getDiscordIntegration", json!({}))).await;
        assert!(!raw.contains("bot-secret"));
        let out: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(out["accountId"], "app_1");
        assert_eq!(out["syncing"], false);
        assert_eq!(out["servers"][0]["name"], "Acme");

        let out = run(&rt, "getSlackIntegration", json!({})).await;
        assert_eq!(out["error"], "Slack integration not found");
    }

    #[tokio::test]
    async fn test_existing_items_are_read_for_the_scoped_member() {
        let store = setup().await;
        let from = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 3, 16, 23, 59, 59).unwrap();
        store
            .save_status_update(&NewStatusUpdate {
                organization_id: "org_1".to_string(),
                member_id: "mem_1".to_string(),
                effective_from: from,
                effective_to: to,
                items: vec![NewStatusItem {
                    content: "Migrated billing".to_string(),
                    is_blocker: false,
                    is_in_progress: true,
                }],
            })
            .await
            .unwrap();
        let window = json!({ "effectiveFrom": WEEK.0, "effectiveTo": WEEK.1 });

        let rt = runtime(store.clone(), Some("mem_1")).with_tool(AgentTool::ExistingStatusItems);
        let out = run(&rt, "getExistingStatusUpdateItems", window.clone()).await;
        assert_eq!(out["items"][0]["content"], "Migrated billing");
        assert_eq!(out["items"][0]["isInProgress"], true);

        let other = runtime(store.clone(), Some("mem_2")).with_tool(AgentTool::ExistingStatusItems);
        let out = run(&other, "getExistingStatusUpdateItems", window.clone()).await;
        assert!(out["items"].as_array().unwrap().is_empty());

        let unscoped = runtime(store.clone(), None).with_tool(AgentTool::ExistingStatusItems);
        let out = run(&unscoped, "getExistingStatusUpdateItems", window.clone()).await;
        assert!(out["error"].as_str().unwrap().contains("no member"));

        let out = run(&runtime(store, Some("mem_1")), "getExistingStatusUpdateItems", window).await;
        assert!(out["error"].as_str().unwrap().contains("unknown tool"));
    }
}
