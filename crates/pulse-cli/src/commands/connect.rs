use anyhow::{bail, Result};
use pulse_store::{NewIntegration, Provider, TargetKind, TargetRow};
use serde_json::json;

use super::{parse_provider, Context};
use crate::ui;

pub struct ConnectArgs {
    pub provider: String,
    pub organization: String,
    pub token: String,
    pub account: Option<String>,
    /// Discord server (guild) ids to walk on sync.
    pub servers: Vec<String>,
}

pub async fn run(ctx: &Context, args: ConnectArgs) -> Result<()> {
    let provider = parse_provider(&args.provider)?;
    if args.token.trim().is_empty() {
        bail!("A credential is required to connect {}", provider.display_name());
    }
    if !args.servers.is_empty() && provider != Provider::Discord {
        bail!("--server only applies to Discord");
    }
    match provider {
        Provider::Slack if args.account.is_none() => {
            ui::warn("No --account given; Slack message sync needs the team id.")
        }
        Provider::Github if args.account.is_none() => {
            ui::warn("No --account given; GitHub sync needs the organization login.")
        }
        Provider::Discord if args.servers.is_empty() => {
            ui::warn("No --server given; Discord sync walks registered servers only.")
        }
        _ => {}
    }

    let integration = ctx
        .store
        .upsert_integration(&NewIntegration {
            organization_id: args.organization.clone(),
            provider,
            credential: args.token,
            external_account_id: args.account,
        })
        .await?;

    if !args.servers.is_empty() {
        let servers: Vec<TargetRow> = args
            .servers
            .iter()
            .map(|id| TargetRow {
                kind: TargetKind::Server,
                external_id: id.clone(),
                parent_external_id: None,
                name: format!("server {}", id),
                metadata: json!({}),
            })
            .collect();
        ctx.store.apply_page(integration.id, &servers).await?;
        ui::info(&format!("Registered {} Discord server(s)", servers.len()));
    }

    ui::success(&format!(
        "{} connected for {} (integration {})",
        provider.display_name(),
        args.organization,
        integration.id
    ));
    ui::detail(&format!("Run `pulse sync --integration {}` to fetch activity.", integration.id));
    Ok(())
}
