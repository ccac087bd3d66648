use anyhow::Result;
use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;

use super::Context;
use crate::ui;

#[derive(Serialize)]
struct IntegrationStatus {
    id: i64,
    organization_id: String,
    provider: String,
    account: Option<String>,
    syncing: bool,
    last_synced: Option<DateTime<Utc>>,
    error: Option<String>,
    events: i64,
    last_run: Option<RunStatus>,
}

#[derive(Serialize)]
struct RunStatus {
    id: i64,
    status: String,
    next_step: usize,
    last_error: Option<String>,
}

async fn collect(ctx: &Context, organization: Option<&str>) -> Result<Vec<IntegrationStatus>> {
    let mut out = Vec::new();
    for integration in ctx.store.list_integrations(organization).await? {
        let events = ctx.store.count_events(integration.id).await?;
        let last_run = ctx
            .store
            .latest_sync_run(integration.id)
            .await?
            .map(|run| RunStatus {
                id: run.id,
                status: run.status.as_str().to_string(),
                next_step: run.next_step,
                last_error: run.last_error,
            });
        out.push(IntegrationStatus {
            id: integration.id,
            organization_id: integration.organization_id,
            provider: integration.provider.as_str().to_string(),
            account: integration.external_account_id,
            syncing: integration.sync_id.is_some(),
            last_synced: integration.sync_finished_at,
            error: integration.sync_error,
            events,
            last_run,
        });
    }
    Ok(out)
}

pub async fn run(ctx: &Context, organization: Option<String>, json: bool) -> Result<()> {
    let statuses = collect(ctx, organization.as_deref()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        ui::info("No integrations connected.");
        return Ok(());
    }

    ui::header("Integrations");
    for s in &statuses {
        let state = if s.syncing {
            style("syncing").cyan()
        } else if s.error.is_some() {
            style("error").red()
        } else {
            style("idle").green()
        };
        println!(
            "  {:>4}  {:<8} {:<20} {:<8} {} events",
            s.id, s.provider, s.organization_id, state, s.events
        );
        if let Some(at) = s.last_synced {
            ui::detail(&format!("last synced {}", at.format("%Y-%m-%d %H:%M UTC")));
        }
        if let Some(err) = &s.error {
            ui::detail(&format!("error: {}", err));
        }
        if let Some(run) = s.last_run.as_ref().filter(|r| r.status == "failed") {
            ui::detail(&format!(
                "run {} failed at step {}; `pulse resume {}` continues it",
                run.id, run.next_step, run.id
            ));
        }
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::PulseConfig;
    use pulse_store::{NewIntegration, Provider, Store};

    #[tokio::test]
    async fn test_collect_reports_runs_and_errors() {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Linear,
                credential: "lin_api".to_string(),
                external_account_id: None,
            })
            .await
            .unwrap();
        let run = store.claim_sync(integration.id, None).await.unwrap().unwrap();
        store.fail_sync_run(run.id, "linear: HTTP 500").await.unwrap();
        store.record_sync_error(integration.id, "linear: HTTP 500").await.unwrap();

        let ctx = Context {
            config: PulseConfig::default(),
            store,
        };
        let statuses = collect(&ctx, Some("org_1")).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].error.as_deref(), Some("linear: HTTP 500"));
        let last_run = statuses[0].last_run.as_ref().unwrap();
        assert_eq!(last_run.status, "failed");
        assert_eq!(last_run.next_step, 0);
        assert!(!statuses[0].syncing);

        assert!(collect(&ctx, Some("org_2")).await.unwrap().is_empty());
    }
}
