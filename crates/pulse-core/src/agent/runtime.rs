//! Bounded tool-calling loop and the two generation entry points.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_store::{NewStatusItem, NewStatusUpdate, Provider, Store, UsageCharge};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::llm::{ChatMessage, ChatModel, ChatRequest};
use super::prompts;
use super::tools::{AgentTool, ToolRuntime, ToolScope};
use super::usage::{UsageKind, UsageMeter};
use super::AgentError;
use crate::config::AgentConfig;
use crate::parser::{parse_category_summary, parse_status_update, CategorySummary, StatusBullet};

#[derive(Debug, Clone)]
pub struct StatusUpdateRequest {
    pub organization_id: String,
    pub member_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Sources the member's activity is read from.
    pub providers: Vec<Provider>,
    pub plan: String,
}

#[derive(Debug, Clone)]
pub struct ActivitySummaryRequest {
    pub organization_id: String,
    pub provider: Provider,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Restrict to these targets; empty means all.
    pub target_ids: Vec<String>,
    pub plan: String,
}

/// Summary of published status updates for an organization or one team.
#[derive(Debug, Clone)]
pub struct StatusSummaryRequest {
    pub organization_id: String,
    pub team_id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub plan: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub bullets: Vec<StatusBullet>,
    pub text: String,
    pub rounds: usize,
    /// Draft the bullets were saved to; `None` when there was no activity.
    pub status_update_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub team_id: Option<String>,
    #[serde(flatten)]
    pub summary: CategorySummary,
    pub text: String,
    pub rounds: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub provider: Provider,
    #[serde(flatten)]
    pub summary: CategorySummary,
    pub text: String,
    pub rounds: usize,
}

pub struct AgentRuntime {
    store: Store,
    model: Arc<dyn ChatModel>,
    meter: Arc<dyn UsageMeter>,
    config: AgentConfig,
}

fn check_window(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(), AgentError> {
    if from > to {
        return Err(AgentError::InvalidRequest("from must not be after to".to_string()));
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<(), AgentError> {
    if value.trim().is_empty() {
        return Err(AgentError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

impl AgentRuntime {
    pub fn new(store: Store, model: Arc<dyn ChatModel>, meter: Arc<dyn UsageMeter>, config: &AgentConfig) -> Self {
        Self {
            store,
            model,
            meter,
            config: config.clone(),
        }
    }

    /// Status bullets for one member over `[from, to]`.
    #[instrument(skip(self, request), fields(org = %request.organization_id, member = %request.member_id))]
    pub async fn generate_status_update(&self, request: &StatusUpdateRequest) -> Result<StatusUpdate, AgentError> {
        require("organization_id", &request.organization_id)?;
        require("member_id", &request.member_id)?;
        check_window(request.from, request.to)?;
        if request.providers.is_empty() {
            return Err(AgentError::InvalidRequest("at least one provider is required".to_string()));
        }

        self.charge(&request.organization_id, UsageKind::StatusGeneration, &request.plan)
            .await?;

        let tools = ToolRuntime::new(
            self.store.clone(),
            ToolScope {
                organization_id: request.organization_id.clone(),
                member_id: Some(request.member_id.clone()),
                ..Default::default()
            },
            &request.providers,
            self.config.event_page_limit,
        )
        .with_tool(AgentTool::ExistingStatusItems);
        let system = prompts::status_update_system_prompt(&request.providers);
        let user =
            prompts::status_update_user_prompt(&request.member_id, &request.organization_id, request.from, request.to);
        let (text, rounds) = self.run_loop(&tools, system, user).await?;

        let bullets = if text.trim() == prompts::NO_ACTIVITY_SENTINEL {
            Vec::new()
        } else {
            parse_status_update(&text)
        };
        let status_update_id = if bullets.is_empty() {
            None
        } else {
            let id = self
                .store
                .save_status_update(&NewStatusUpdate {
                    organization_id: request.organization_id.clone(),
                    member_id: request.member_id.clone(),
                    effective_from: request.from,
                    effective_to: request.to,
                    items: bullets
                        .iter()
                        .map(|b| NewStatusItem {
                            content: b.content.clone(),
                            is_blocker: b.is_blocker,
                            is_in_progress: b.is_in_progress,
                        })
                        .collect(),
                })
                .await?;
            info!("Saved {} status items to draft {}", bullets.len(), id);
            Some(id)
        };

        Ok(StatusUpdate {
            bullets,
            text,
            rounds,
            status_update_id,
        })
    }

    /// Organization-wide summary for one provider.
    #[instrument(skip(self, request), fields(org = %request.organization_id, provider = %request.provider))]
    pub async fn summarize_activity(&self, request: &ActivitySummaryRequest) -> Result<ActivitySummary, AgentError> {
        require("organization_id", &request.organization_id)?;
        check_window(request.from, request.to)?;

        self.charge(&request.organization_id, UsageKind::SummaryGeneration, &request.plan)
            .await?;

        let tools = ToolRuntime::new(
            self.store.clone(),
            ToolScope {
                organization_id: request.organization_id.clone(),
                target_ids: request.target_ids.clone(),
                ..Default::default()
            },
            &[request.provider],
            self.config.event_page_limit,
        );
        let system = prompts::activity_summary_system_prompt(request.provider);
        let user = prompts::activity_summary_user_prompt(
            request.provider,
            &request.organization_id,
            request.from,
            request.to,
            &request.target_ids,
        );
        let (text, rounds) = self.run_loop(&tools, system, user).await?;

        Ok(ActivitySummary {
            provider: request.provider,
            summary: parse_category_summary(&text, prompts::summary_scope(request.provider)),
            text,
            rounds,
        })
    }

    /// One `(general)` line plus a `(user)` line per member with a published update.
    #[instrument(skip(self, request), fields(org = %request.organization_id, team = ?request.team_id))]
    pub async fn summarize_status_updates(&self, request: &StatusSummaryRequest) -> Result<StatusSummary, AgentError> {
        require("organization_id", &request.organization_id)?;
        if let Some(team_id) = &request.team_id {
            require("team_id", team_id)?;
        }
        check_window(request.from, request.to)?;

        self.charge(&request.organization_id, UsageKind::SummaryGeneration, &request.plan)
            .await?;

        let tools = ToolRuntime::new(
            self.store.clone(),
            ToolScope {
                organization_id: request.organization_id.clone(),
                team_id: request.team_id.clone(),
                ..Default::default()
            },
            &[],
            self.config.event_page_limit,
        )
        .with_tool(AgentTool::StatusUpdates);
        let team_id = request.team_id.as_deref();
        let system = prompts::status_summary_system_prompt(team_id);
        let user = prompts::status_summary_user_prompt(&request.organization_id, team_id, request.from, request.to);
        let (text, rounds) = self.run_loop(&tools, system, user).await?;

        Ok(StatusSummary {
            team_id: request.team_id.clone(),
            summary: parse_category_summary(&text, prompts::MEMBER_SCOPE),
            text,
            rounds,
        })
    }

    async fn charge(&self, organization_id: &str, kind: UsageKind, plan: &str) -> Result<(), AgentError> {
        match self.meter.charge(organization_id, kind, plan).await? {
            UsageCharge::Charged { used, from_add_on } => {
                info!("Charged {} ({} used this period, add-on: {})", kind.as_str(), used, from_add_on);
                Ok(())
            }
            UsageCharge::Refused { used, limit } => Err(AgentError::UsageLimitExceeded {
                organization_id: organization_id.to_string(),
                used,
                limit,
            }),
        }
    }

    /// Returns the final text and how many model rounds it took.
    async fn run_loop(&self, tools: &ToolRuntime, system: String, user: String) -> Result<(String, usize), AgentError> {
        let definitions = tools.definitions();
        let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let mut last_text = String::new();
        let max_rounds = self.config.max_rounds.max(1);

        for round in 1..=max_rounds {
            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
                seed: Some(self.config.seed),
            };
            let response = self.model.chat(&request).await?;
            let message = response.message;
            if !message.content.trim().is_empty() {
                last_text = message.content.clone();
            }
            if message.tool_calls.is_empty() {
                return Ok((last_text, round));
            }

            let calls = message.tool_calls.clone();
            messages.push(message);
            for call in &calls {
                let output = tools.execute(call).await;
                messages.push(ChatMessage::tool_result(call.id.clone(), output));
            }
        }

        warn!("Tool loop stopped after {} rounds, using last text", max_rounds);
        Ok((last_text, max_rounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{ChatResponse, LlmError, Role, ToolCall};
    use crate::agent::usage::StoreUsageMeter;
    use crate::config::UsageConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pulse_store::{EventRow, MemberIdentity, NewIntegration};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses; repeats the last one when the script runs out.
    struct ScriptedModel {
        script: Mutex<VecDeque<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 { script.pop_front() } else { script.front().cloned() };
            next.ok_or_else(|| LlmError::ResponseFormat("empty script".to_string()))
        }
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            message: ChatMessage::assistant(content),
            finish_reason: "stop".to_string(),
        }
    }

    fn tool_call(content: &str, name: &str, arguments: serde_json::Value) -> ChatResponse {
        ChatResponse {
            message: ChatMessage {
                role: Role::Assistant,
                content: content.to_string(),
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                }],
                tool_call_id: None,
            },
            finish_reason: "tool_calls".to_string(),
        }
    }

    fn week() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 16, 23, 59, 59).unwrap(),
        )
    }

    async fn setup() -> Store {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Github,
                credential: "ghs".to_string(),
                external_account_id: Some("acme".to_string()),
            })
            .await
            .unwrap();
        store
            .apply_page(
                integration.id,
                &[EventRow {
                    external_id: "ev1".to_string(),
                    kind: "pull_request".to_string(),
                    action: Some("opened".to_string()),
                    target_external_id: Some("1".to_string()),
                    actor_external_id: Some("7".to_string()),
                    payload: json!({ "title": "Add rate limiting" }),
                    occurred_at: Utc.with_ymd_and_hms(2025, 3, 11, 9, 0, 0).unwrap(),
                }],
            )
            .await
            .unwrap();
        store
            .link_member_identity(&MemberIdentity {
                organization_id: "org_1".to_string(),
                member_id: "mem_1".to_string(),
                provider: Provider::Github,
                external_user_id: "7".to_string(),
            })
            .await
            .unwrap();
        store
    }

    fn runtime(store: Store, model: Arc<ScriptedModel>, max_rounds: usize) -> AgentRuntime {
        let config = AgentConfig {
            max_rounds,
            ..Default::default()
        };
        let meter = Arc::new(StoreUsageMeter::new(store.clone(), UsageConfig::default()));
        AgentRuntime::new(store, model, meter, &config)
    }

    fn status_request() -> StatusUpdateRequest {
        let (from, to) = week();
        StatusUpdateRequest {
            organization_id: "org_1".to_string(),
            member_id: "mem_1".to_string(),
            from,
            to,
            providers: vec![Provider::Github],
            plan: "basic".to_string(),
        }
    }

    #[tokio::test]
    async fn test_status_update_runs_tools_then_parses() {
        let store = setup().await;
        let model = ScriptedModel::new(vec![
            tool_call(
                "",
                "listGitHubEvents",
                json!({ "effectiveFrom": "2025-03-10T00:00:00Z", "effectiveTo": "2025-03-16T23:59:59Z" }),
            ),
            text("- (blocker=false,in-progress=true) Adding rate limiting.\n- Reviewed docs"),
        ]);
        let runtime = runtime(store, model.clone(), 30);

        let update = runtime.generate_status_update(&status_request()).await.unwrap();
        assert_eq!(update.rounds, 2);
        assert_eq!(update.bullets.len(), 2);
        assert_eq!(update.bullets[0].content, "Adding rate limiting");
        assert!(update.bullets[0].is_in_progress);

        let (from, to) = week();
        let saved = runtime.store.status_items("org_1", "mem_1", from, to).await.unwrap();
        assert!(update.status_update_id.is_some());
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].content, "Reviewed docs");

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].seed, Some(123));
        let names: Vec<&str> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"getExistingStatusUpdateItems"));
        assert!(names.contains(&"getGitHubIntegration"));
        let tool_reply = requests[1].messages.last().unwrap();
        assert_eq!(tool_reply.role, Role::Tool);
        assert!(tool_reply.content.contains("Add rate limiting"));
    }

    #[tokio::test]
    async fn test_round_cap_falls_back_to_last_text() {
        let store = setup().await;
        let model = ScriptedModel::new(vec![tool_call(
            "- (blocker=true,in-progress=false) Waiting on review",
            "getGitHubUser",
            json!({ "userId": "7" }),
        )]);
        let runtime = runtime(store, model.clone(), 3);

        let update = runtime.generate_status_update(&status_request()).await.unwrap();
        assert_eq!(model.calls(), 3);
        assert_eq!(update.rounds, 3);
        assert!(update.bullets[0].is_blocker);
    }

    #[tokio::test]
    async fn test_usage_limit_stops_before_the_model() {
        let store = setup().await;
        let model = ScriptedModel::new(vec![text("unused")]);
        let mut usage = UsageConfig::default();
        usage.plans.insert("free".to_string(), 0);
        let meter = Arc::new(StoreUsageMeter::new(store.clone(), usage));
        let runtime = AgentRuntime::new(store, model.clone(), meter, &AgentConfig::default());

        let mut request = status_request();
        request.plan = "free".to_string();
        let err = runtime.generate_status_update(&request).await.unwrap_err();
        assert!(matches!(err, AgentError::UsageLimitExceeded { limit: 0, .. }));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_summary_uses_category_grammar() {
        let store = setup().await;
        let model = ScriptedModel::new(vec![text("- (general) Busy week\n- (repo) api: shipped v2\n- web: new nav")]);
        let runtime = runtime(store, model, 30);
        let (from, to) = week();

        let summary = runtime
            .summarize_activity(&ActivitySummaryRequest {
                organization_id: "org_1".to_string(),
                provider: Provider::Github,
                from,
                to,
                target_ids: Vec::new(),
                plan: "basic".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(summary.summary.general_summary.as_deref(), Some("Busy week"));
        assert_eq!(summary.summary.summaries.len(), 2);
        assert_eq!(summary.summary.summaries[1].scope, "repo");
    }

    #[tokio::test]
    async fn test_no_activity_saves_nothing() {
        let store = setup().await;
        let model = ScriptedModel::new(vec![text(prompts::NO_ACTIVITY_SENTINEL)]);
        let runtime = runtime(store, model, 30);

        let update = runtime.generate_status_update(&status_request()).await.unwrap();
        assert!(update.bullets.is_empty());
        assert!(update.status_update_id.is_none());
        let (from, to) = week();
        assert!(runtime.store.status_items("org_1", "mem_1", from, to).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summary_target_filter_reaches_the_event_query() {
        let store = setup().await;
        let integration = store.list_integrations(Some("org_1")).await.unwrap().remove(0);
        store
            .apply_page(
                integration.id,
                &[EventRow {
                    external_id: "ev2".to_string(),
                    kind: "push".to_string(),
                    action: None,
                    target_external_id: Some("2".to_string()),
                    actor_external_id: Some("8".to_string()),
                    payload: json!({ "title": "Rewrite the marketing site" }),
                    occurred_at: Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap(),
                }],
            )
            .await
            .unwrap();
        let model = ScriptedModel::new(vec![
            tool_call(
                "",
                "listGitHubEvents",
                json!({ "effectiveFrom": "2025-03-10T00:00:00Z", "effectiveTo": "2025-03-16T23:59:59Z" }),
            ),
            text("- (general) Rate limiting landed"),
        ]);
        let runtime = runtime(store, model.clone(), 30);
        let (from, to) = week();

        runtime
            .summarize_activity(&ActivitySummaryRequest {
                organization_id: "org_1".to_string(),
                provider: Provider::Github,
                from,
                to,
                target_ids: vec!["1".to_string()],
                plan: "basic".to_string(),
            })
            .await
            .unwrap();

        let requests = model.requests.lock().unwrap();
        let tool_reply = &requests[1].messages.last().unwrap().content;
        assert!(tool_reply.contains("Add rate limiting"));
        assert!(!tool_reply.contains("marketing"));
    }

    #[tokio::test]
    async fn test_team_status_summary_tags_members() {
        let store = setup().await;
        let (from, to) = week();
        for (member, work) in [("mem_1", "Shipped billing"), ("mem_2", "Redesigned onboarding")] {
            let id = store
                .save_status_update(&NewStatusUpdate {
                    organization_id: "org_1".to_string(),
                    member_id: member.to_string(),
                    effective_from: from,
                    effective_to: to,
                    items: vec![NewStatusItem {
                        content: work.to_string(),
                        is_blocker: false,
                        is_in_progress: false,
                    }],
                })
                .await
                .unwrap();
            store.publish_status_update(id, None, None).await.unwrap();
        }
        store.add_team_member("org_1", "platform", "mem_1").await.unwrap();

        let model = ScriptedModel::new(vec![
            tool_call(
                "",
                "listStatusUpdates",
                json!({ "effectiveFrom": "2025-03-10T00:00:00Z", "effectiveTo": "2025-03-16T23:59:59Z" }),
            ),
            text("- (general) Billing is live\n- (user) mem_1 shipped billing"),
        ]);
        let runtime = runtime(store, model.clone(), 30);

        let summary = runtime
            .summarize_status_updates(&StatusSummaryRequest {
                organization_id: "org_1".to_string(),
                team_id: Some("platform".to_string()),
                from,
                to,
                plan: "basic".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(summary.summary.general_summary.as_deref(), Some("Billing is live"));
        assert_eq!(summary.summary.summaries.len(), 1);
        assert_eq!(summary.summary.summaries[0].scope, "user");

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests[0].tools.len(), 1);
        let tool_reply = &requests[1].messages.last().unwrap().content;
        assert!(tool_reply.contains("Shipped billing"));
        assert!(!tool_reply.contains("onboarding"));
    }

    #[tokio::test]
    async fn test_invalid_window_is_rejected() {
        let store = setup().await;
        let model = ScriptedModel::new(vec![text("unused")]);
        let runtime = runtime(store, model.clone(), 30);
        let mut request = status_request();
        std::mem::swap(&mut request.from, &mut request.to);

        let err = runtime.generate_status_update(&request).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
        assert_eq!(model.calls(), 0);
    }
}
