use anyhow::{bail, Result};
use chrono::Utc;
use serde_json::json;

use super::Context;
use crate::ui;

pub async fn run(
    ctx: &Context,
    organization: &str,
    period: Option<String>,
    plan: Option<String>,
    grant: Option<i64>,
    json: bool,
) -> Result<()> {
    if let Some(credits) = grant {
        if credits <= 0 {
            bail!("--grant must be positive");
        }
        let remaining = ctx.store.grant_add_on_credits(organization, credits).await?;
        ui::success(&format!("Granted {} add-on credits ({} remaining)", credits, remaining));
    }

    let period = period.unwrap_or_else(|| Utc::now().format("%Y-%m").to_string());
    let plan = plan.unwrap_or_else(|| ctx.config.usage.default_plan.clone());
    let limit = ctx.config.usage.plan_limit(&plan);
    let snapshot = ctx.store.usage_snapshot(organization, &period).await?;

    if json {
        let body = json!({
            "organizationId": snapshot.organization_id,
            "period": snapshot.period,
            "plan": plan,
            "limit": limit,
            "used": snapshot.total,
            "byKind": snapshot.by_kind.iter().map(|(k, n)| json!({ "kind": k, "count": n })).collect::<Vec<_>>(),
            "addOnRemaining": snapshot.add_on_remaining,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    ui::header(&format!("Usage for {} in {}", organization, period));
    match limit {
        Some(limit) => ui::info(&format!("{} of {} generations ({} plan)", snapshot.total, limit, plan)),
        None => ui::warn(&format!("Unknown plan {}; {} generations used", plan, snapshot.total)),
    }
    for (kind, count) in &snapshot.by_kind {
        ui::detail(&format!("{}: {}", kind, count));
    }
    ui::info(&format!("{} add-on credits remaining", snapshot.add_on_remaining));
    println!();
    Ok(())
}
