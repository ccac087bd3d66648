use std::sync::Arc;

use anyhow::{bail, Result};
use pulse_core::{
    ChannelQueue, EventFanout, EventProjector, ProviderRegistry, SyncError, SyncOrchestrator, SyncOutcome,
    SyncRequest,
};
use tokio::task::JoinHandle;
use tracing::info;

use super::{parse_time, Context};
use crate::ui;

/// Orchestrator wired to an in-process queue whose consumer projects events.
fn orchestrator(ctx: &Context) -> Result<(SyncOrchestrator, JoinHandle<usize>)> {
    let registry = Arc::new(ProviderRegistry::from_config(&ctx.config, ctx.http()?));
    let (queue, rx) = ChannelQueue::new(64);
    let projector = EventProjector::new(ctx.store.clone());
    let consumer = tokio::spawn(projector.run(rx));
    let fanout = EventFanout::new(Arc::new(queue), ctx.config.sync.fanout_batch_size);
    let orchestrator = SyncOrchestrator::new(ctx.store.clone(), registry, &ctx.config.sync).with_fanout(fanout);
    Ok((orchestrator, consumer))
}

pub async fn run(
    ctx: &Context,
    integration_ids: Vec<i64>,
    organization: Option<String>,
    since: Option<String>,
) -> Result<()> {
    let ids = if integration_ids.is_empty() {
        ctx.store
            .list_integrations(organization.as_deref())
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect()
    } else {
        integration_ids
    };
    if ids.is_empty() {
        ui::info("No integrations to sync. Connect one with:");
        println!("    pulse connect github --org <org> --token <token> --account <login>");
        return Ok(());
    }

    let request = SyncRequest {
        min_event_at: since.as_deref().map(|s| parse_time("since", s)).transpose()?,
    };

    let (orchestrator, consumer) = orchestrator(ctx)?;
    let pb = ui::spinner(&format!("Syncing {} integration(s)", ids.len()));
    let results = orchestrator.sync_many(&ids, request).await;
    pb.finish_and_clear();
    drop(orchestrator);
    let projected = consumer.await.unwrap_or(0);

    let mut failures = 0;
    for (integration_id, result) in results {
        match result {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => {
                failures += 1;
                print_failure(integration_id, &e);
            }
        }
    }
    info!("Projected {} events", projected);

    if failures > 0 {
        bail!("{} integration(s) failed to sync", failures);
    }
    Ok(())
}

pub async fn resume(ctx: &Context, run_id: i64) -> Result<()> {
    let (orchestrator, consumer) = orchestrator(ctx)?;
    let pb = ui::spinner(&format!("Resuming sync run {}", run_id));
    let result = orchestrator.resume(run_id).await;
    pb.finish_and_clear();
    drop(orchestrator);
    consumer.await.ok();

    match result {
        Ok(outcome) => {
            print_outcome(&outcome);
            Ok(())
        }
        Err(e) => {
            ui::error(&format!("Sync run {}: {}", run_id, e));
            Err(e.into())
        }
    }
}

fn print_outcome(outcome: &SyncOutcome) {
    let upserted: usize = outcome.steps.iter().map(|s| s.report.upserted).sum();
    if outcome.steps.is_empty() {
        ui::success(&format!(
            "{} (integration {}): nothing left to do",
            outcome.provider.display_name(),
            outcome.integration_id
        ));
        return;
    }
    ui::success(&format!(
        "{} (integration {}): {} records, {} events queued",
        outcome.provider.display_name(),
        outcome.integration_id,
        upserted,
        outcome.events_queued
    ));
    for step in &outcome.steps {
        let r = &step.report;
        let mut line = format!(
            "{}: {} pages, {} upserted, {} dropped, {} deleted",
            step.step, r.pages, r.upserted, r.dropped, r.deleted
        );
        if r.truncated {
            line.push_str(" (page limit reached)");
        }
        ui::detail(&line);
        for skipped in &r.skipped {
            ui::warn(&format!("skipped {}", skipped));
        }
    }
}

fn print_failure(integration_id: i64, err: &SyncError) {
    ui::error(&format!("integration {}: {}", integration_id, err));
    if let SyncError::AlreadyRunning(_) = err {
        ui::detail("Another sync holds this integration; try again when it finishes.");
    } else {
        ui::detail("Resume from the failed step with `pulse resume <run id>` (see `pulse status`).");
    }
}
