use anyhow::Result;
use pulse_store::MemberIdentity;

use super::{parse_provider, Context};
use crate::ui;

pub async fn run(ctx: &Context, organization: &str, member: &str, provider: &str, user: &str) -> Result<()> {
    let provider = parse_provider(provider)?;
    ctx.store
        .link_member_identity(&MemberIdentity {
            organization_id: organization.to_string(),
            member_id: member.to_string(),
            provider,
            external_user_id: user.to_string(),
        })
        .await?;

    let known = ctx
        .store
        .get_provider_user(organization, provider, user)
        .await?;
    match known {
        Some(u) => ui::success(&format!(
            "Linked {} to {} user {}",
            member,
            provider.display_name(),
            u.display_name.unwrap_or(u.username)
        )),
        None => {
            ui::success(&format!("Linked {} to {} user {}", member, provider.display_name(), user));
            ui::detail("That user has not been synced yet.");
        }
    }
    Ok(())
}

pub async fn join_team(ctx: &Context, organization: &str, team: &str, member: &str) -> Result<()> {
    ctx.store.add_team_member(organization, team, member).await?;
    ui::success(&format!("Added {} to team {}", member, team));
    Ok(())
}
