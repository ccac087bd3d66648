use std::sync::Arc;

use anyhow::{anyhow, Result};
use pulse_core::agent::{
    ActivitySummaryRequest, AgentError, AgentRuntime, OpenAiChatModel, StatusSummaryRequest, StatusUpdateRequest,
    StoreUsageMeter, NO_ACTIVITY_SENTINEL,
};
use pulse_core::parser::CategorySummary;
use pulse_store::Provider;

use super::{parse_provider, window, Context};
use crate::ui;

pub struct StatusUpdateArgs {
    pub organization: String,
    pub member: String,
    pub providers: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub plan: Option<String>,
    pub json: bool,
}

pub struct SummarizeArgs {
    pub organization: String,
    pub provider: String,
    pub targets: Vec<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub plan: Option<String>,
    pub json: bool,
}

pub struct StatusSummaryArgs {
    pub organization: String,
    pub team: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub plan: Option<String>,
    pub json: bool,
}

fn runtime(ctx: &Context) -> Result<AgentRuntime> {
    let api_key = ctx.config.agent.api_key.as_deref().ok_or_else(|| {
        anyhow!(
            "No model API key configured. Set {} or [agent].api_key.",
            pulse_core::config::ENV_LLM_API_KEY
        )
    })?;
    let model = OpenAiChatModel::new(ctx.http()?, &ctx.config.agent.api_base_url, api_key);
    let meter = StoreUsageMeter::new(ctx.store.clone(), ctx.config.usage.clone());
    Ok(AgentRuntime::new(
        ctx.store.clone(),
        Arc::new(model),
        Arc::new(meter),
        &ctx.config.agent,
    ))
}

/// Every provider the organization has connected, when none were named.
async fn resolve_providers(ctx: &Context, organization: &str, named: &[String]) -> Result<Vec<Provider>> {
    if !named.is_empty() {
        return named.iter().map(|p| parse_provider(p)).collect();
    }
    let mut providers: Vec<Provider> = ctx
        .store
        .list_integrations(Some(organization))
        .await?
        .into_iter()
        .map(|i| i.provider)
        .collect();
    providers.sort_by_key(|p| p.as_str());
    providers.dedup();
    Ok(providers)
}

fn explain(err: AgentError) -> anyhow::Error {
    if let AgentError::UsageLimitExceeded { used, limit, .. } = &err {
        ui::error(&format!("Generation limit reached ({} of {} this month).", used, limit));
        ui::detail("Grant add-on credits with `pulse usage --org <org> --grant <n>`.");
    }
    err.into()
}

pub async fn status_update(ctx: &Context, args: StatusUpdateArgs) -> Result<()> {
    let (from, to) = window(args.from.as_deref(), args.to.as_deref())?;
    let providers = resolve_providers(ctx, &args.organization, &args.providers).await?;
    let runtime = runtime(ctx)?;

    let pb = ui::spinner(&format!("Writing status update for {}", args.member));
    let result = runtime
        .generate_status_update(&StatusUpdateRequest {
            organization_id: args.organization,
            member_id: args.member,
            from,
            to,
            providers,
            plan: args.plan.unwrap_or_else(|| ctx.config.usage.default_plan.clone()),
        })
        .await;
    pb.finish_and_clear();
    let update = result.map_err(explain)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&update)?);
        return Ok(());
    }
    ui::header(&format!("Status {} to {}", from.format("%Y-%m-%d"), to.format("%Y-%m-%d")));
    if update.text.trim() == NO_ACTIVITY_SENTINEL {
        ui::info(NO_ACTIVITY_SENTINEL);
        return Ok(());
    }
    for b in &update.bullets {
        ui::bullet(&b.content, b.is_blocker, b.is_in_progress);
    }
    if let Some(id) = update.status_update_id {
        println!();
        ui::detail(&format!("Saved as draft {}. Publish it with `pulse publish {}`.", id, id));
    }
    println!();
    Ok(())
}

pub async fn summarize(ctx: &Context, args: SummarizeArgs) -> Result<()> {
    let (from, to) = window(args.from.as_deref(), args.to.as_deref())?;
    let provider = parse_provider(&args.provider)?;
    let runtime = runtime(ctx)?;

    let pb = ui::spinner(&format!("Summarizing {} activity", provider.display_name()));
    let result = runtime
        .summarize_activity(&ActivitySummaryRequest {
            organization_id: args.organization,
            provider,
            from,
            to,
            target_ids: args.targets,
            plan: args.plan.unwrap_or_else(|| ctx.config.usage.default_plan.clone()),
        })
        .await;
    pb.finish_and_clear();
    let summary = result.map_err(explain)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    ui::header(&format!("{} activity", provider.display_name()));
    print_category_summary(&summary.summary, &summary.text);
    Ok(())
}

pub async fn status_summary(ctx: &Context, args: StatusSummaryArgs) -> Result<()> {
    let (from, to) = window(args.from.as_deref(), args.to.as_deref())?;
    let runtime = runtime(ctx)?;

    let subject = args.team.as_deref().map_or_else(|| args.organization.clone(), |t| format!("team {}", t));
    let pb = ui::spinner(&format!("Summarizing status updates for {}", subject));
    let result = runtime
        .summarize_status_updates(&StatusSummaryRequest {
            organization_id: args.organization,
            team_id: args.team,
            from,
            to,
            plan: args.plan.unwrap_or_else(|| ctx.config.usage.default_plan.clone()),
        })
        .await;
    pb.finish_and_clear();
    let summary = result.map_err(explain)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    ui::header(&format!("Status summary for {}", subject));
    print_category_summary(&summary.summary, &summary.text);
    Ok(())
}

pub async fn publish(ctx: &Context, id: i64, mood: Option<&str>, notes: Option<&str>) -> Result<()> {
    if !ctx.store.publish_status_update(id, mood, notes).await? {
        return Err(anyhow!("No status update with id {}", id));
    }
    ui::success(&format!("Published status update {}", id));
    Ok(())
}

fn print_category_summary(summary: &CategorySummary, text: &str) {
    if let Some(general) = &summary.general_summary {
        ui::info(general);
        println!();
    }
    for s in &summary.summaries {
        println!("  - ({}) {}", s.scope, s.content);
    }
    if summary.general_summary.is_none() && summary.summaries.is_empty() {
        ui::info(text.trim());
    }
    println!();
}
