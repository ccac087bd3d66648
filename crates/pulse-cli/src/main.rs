use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod paths;
mod ui;

use commands::Context;

#[derive(Parser)]
#[command(name = "pulse")]
#[command(about = "Team activity sync and status updates.")]
#[command(version)]
struct Cli {
    /// Config file (defaults to config.toml in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect a provider for an organization
    Connect {
        /// Provider to connect (slack, discord, linear, github)
        #[arg(value_name = "PROVIDER")]
        provider: String,

        #[arg(long = "org")]
        organization: String,

        /// Bot token, installation token or API key
        #[arg(long)]
        token: String,

        /// Provider account id (Slack team id, GitHub organization login, ...)
        #[arg(long)]
        account: Option<String>,

        /// Discord server id to sync (repeatable)
        #[arg(long = "server", value_name = "ID")]
        servers: Vec<String>,
    },

    /// Sync integrations (all of them when none are named)
    Sync {
        #[arg(long = "integration", value_name = "ID")]
        integrations: Vec<i64>,

        /// Only integrations of this organization
        #[arg(long = "org")]
        organization: Option<String>,

        /// Lower bound for event listings (RFC 3339); defaults to the start of the week
        #[arg(long)]
        since: Option<String>,
    },

    /// Continue a failed sync run from its last completed step
    Resume {
        #[arg(value_name = "RUN_ID")]
        run_id: i64,
    },

    /// Show integrations and their sync state
    Status {
        #[arg(long = "org")]
        organization: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write status bullets for one member
    StatusUpdate {
        #[arg(long = "org")]
        organization: String,

        #[arg(long)]
        member: String,

        /// Sources to read (repeatable); defaults to every connected provider
        #[arg(long = "provider", value_name = "PROVIDER")]
        providers: Vec<String>,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        #[arg(long)]
        plan: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Summarize one provider's activity across the organization
    Summarize {
        #[arg(value_name = "PROVIDER")]
        provider: String,

        #[arg(long = "org")]
        organization: String,

        /// Restrict to these target ids (repeatable)
        #[arg(long = "target", value_name = "ID")]
        targets: Vec<String>,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        #[arg(long)]
        plan: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Summarize published status updates for an organization or one team
    SummarizeStatus {
        #[arg(long = "org")]
        organization: String,

        #[arg(long)]
        team: Option<String>,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        #[arg(long)]
        plan: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Publish a draft status update so summaries include it
    Publish {
        #[arg(value_name = "STATUS_UPDATE_ID")]
        id: i64,

        #[arg(long)]
        mood: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Add a member to a team
    JoinTeam {
        #[arg(long = "org")]
        organization: String,

        #[arg(long)]
        team: String,

        #[arg(long)]
        member: String,
    },

    /// Show generation usage, optionally granting add-on credits
    Usage {
        #[arg(long = "org")]
        organization: String,

        /// Period as YYYY-MM; defaults to the current month
        #[arg(long)]
        period: Option<String>,

        #[arg(long)]
        plan: Option<String>,

        /// Add-on credits to grant
        #[arg(long)]
        grant: Option<i64>,

        #[arg(long)]
        json: bool,
    },

    /// Link an organization member to their provider user id
    LinkMember {
        #[arg(long = "org")]
        organization: String,

        #[arg(long)]
        member: String,

        #[arg(long)]
        provider: String,

        /// Provider-side user id
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Debug logs stay hidden unless RUST_LOG asks for them
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let ctx = Context::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Connect {
            provider,
            organization,
            token,
            account,
            servers,
        } => {
            commands::connect::run(
                &ctx,
                commands::connect::ConnectArgs {
                    provider,
                    organization,
                    token,
                    account,
                    servers,
                },
            )
            .await
        }
        Commands::Sync {
            integrations,
            organization,
            since,
        } => commands::sync::run(&ctx, integrations, organization, since).await,
        Commands::Resume { run_id } => commands::sync::resume(&ctx, run_id).await,
        Commands::Status { organization, json } => commands::status::run(&ctx, organization, json).await,
        Commands::StatusUpdate {
            organization,
            member,
            providers,
            from,
            to,
            plan,
            json,
        } => {
            commands::generate::status_update(
                &ctx,
                commands::generate::StatusUpdateArgs {
                    organization,
                    member,
                    providers,
                    from,
                    to,
                    plan,
                    json,
                },
            )
            .await
        }
        Commands::Summarize {
            provider,
            organization,
            targets,
            from,
            to,
            plan,
            json,
        } => {
            commands::generate::summarize(
                &ctx,
                commands::generate::SummarizeArgs {
                    organization,
                    provider,
                    targets,
                    from,
                    to,
                    plan,
                    json,
                },
            )
            .await
        }
        Commands::SummarizeStatus {
            organization,
            team,
            from,
            to,
            plan,
            json,
        } => {
            commands::generate::status_summary(
                &ctx,
                commands::generate::StatusSummaryArgs {
                    organization,
                    team,
                    from,
                    to,
                    plan,
                    json,
                },
            )
            .await
        }
        Commands::Publish { id, mood, notes } => {
            commands::generate::publish(&ctx, id, mood.as_deref(), notes.as_deref()).await
        }
        Commands::JoinTeam {
            organization,
            team,
            member,
        } => commands::link::join_team(&ctx, &organization, &team, &member).await,
        Commands::Usage {
            organization,
            period,
            plan,
            grant,
            json,
        } => commands::usage::run(&ctx, &organization, period, plan, grant, json).await,
        Commands::LinkMember {
            organization,
            member,
            provider,
            user,
        } => commands::link::run(&ctx, &organization, &member, &provider, &user).await,
    }
}
