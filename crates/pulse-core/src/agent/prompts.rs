//! System and user prompts for the two generation entry points.

use chrono::{DateTime, SecondsFormat, Utc};
use pulse_store::Provider;

use super::tools::AgentTool;

/// The single line the model must answer with when no source has events.
pub const NO_ACTIVITY_SENTINEL: &str = "No activity found during this period.";

fn tool_names(providers: &[Provider]) -> String {
    providers
        .iter()
        .map(|p| AgentTool::ListEvents(*p).name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Repeatable tag the category grammar uses for a provider's summaries.
pub fn summary_scope(provider: Provider) -> &'static str {
    match provider {
        Provider::Github => "repo",
        Provider::Linear => "project",
        Provider::Slack | Provider::Discord => "channel",
    }
}

pub fn status_update_system_prompt(providers: &[Provider]) -> String {
    format!(
        r#"You write concise status update bullet points for one team member.

PROCESS:
1. Call {existing} first. When it returns items, enrich them with new activity, keep their status prefixes and match their wording.
2. Call every listing tool: {listings}. Each returns only this member's events.
3. Use the event detail tools when a listing summary is ambiguous. The integration tools give account and server context.
4. Before naming a person, channel, repository or project, resolve its id with the matching user or target tool. Never print a raw id.

OUTPUT FORMAT:
Every line is one bullet starting with a status prefix in exactly this shape:
- (blocker=true,in-progress=false) work that is blocked or waiting on someone
- (blocker=false,in-progress=true) work still underway
- (blocker=false,in-progress=false) finished work

RULES:
- First person, outcome focused, at most 10 bullets and about 100 words.
- Group related events into one bullet.
- A source whose listing returned no events gets no bullets.
- If no source returned any events, answer with exactly: {sentinel}
- Only describe activity present in the tool results."#,
        existing = AgentTool::ExistingStatusItems.name(),
        listings = tool_names(providers),
        sentinel = NO_ACTIVITY_SENTINEL,
    )
}

pub fn status_update_user_prompt(member_id: &str, organization_id: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    format!(
        "Generate status update bullet points for member {member_id} in organization {organization_id}.\n\
         effectiveFrom: {}\neffectiveTo: {}",
        from.to_rfc3339_opts(SecondsFormat::Secs, true),
        to.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

pub fn activity_summary_system_prompt(provider: Provider) -> String {
    let scope = summary_scope(provider);
    // Linear work is also grouped by team.
    let extra_scope = if provider == Provider::Linear {
        "\n- (team) one line per team with its key issues, decisions and blockers"
    } else {
        ""
    };
    format!(
        r#"You summarize {source} activity for an engineering organization.

PROCESS:
1. Call {listing} first to get the events for the period.
2. Use {detail} only to clarify specific events.
3. Resolve ids with {user} and {target} before naming anyone or anything.

OUTPUT FORMAT:
- (general) one line on overall themes, risks and notable achievements
- ({scope}) one line per {scope} with its key work
- ({scope}) another {scope}{extra_scope}

RULES:
- Third person, concise, outcome focused.
- Exactly one (general) line; as many ({scope}) lines as there are active {scope}s.
- If the listing returned no events, answer with exactly: {sentinel}
- Only use information from the tool results."#,
        source = provider.display_name(),
        listing = AgentTool::ListEvents(provider).name(),
        detail = AgentTool::EventDetail(provider).name(),
        user = AgentTool::User(provider).name(),
        target = AgentTool::Target(provider).name(),
        sentinel = NO_ACTIVITY_SENTINEL,
    )
}

pub fn activity_summary_user_prompt(
    provider: Provider,
    organization_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    target_ids: &[String],
) -> String {
    let filter = if target_ids.is_empty() {
        "ALL".to_string()
    } else {
        target_ids.join(",")
    };
    format!(
        "Create a {} activity summary for organization {organization_id}.\n\
         effectiveFrom: {}\neffectiveTo: {}\n{} filter: {filter}",
        provider.display_name(),
        from.to_rfc3339_opts(SecondsFormat::Secs, true),
        to.to_rfc3339_opts(SecondsFormat::Secs, true),
        summary_scope(provider),
    )
}

/// Tag for the per-member lines of a status update summary.
pub const MEMBER_SCOPE: &str = "user";

pub fn status_summary_system_prompt(team_id: Option<&str>) -> String {
    let audience = if team_id.is_some() { "team" } else { "organization" };
    format!(
        r#"You create concise {audience} status summaries from members' status updates.

PROCESS:
1. Call {listing} first to get the published status updates for the period.
2. Look for blockers, achievements, in-progress work and mood across members.

OUTPUT FORMAT:
- (general) one line on {audience} health, cross-cutting blockers, major achievements and mood
- ({member}) one line per member with their accomplishments, current focus and blockers
- ({member}) another member

RULES:
- Third person, one or two sentences per member, blockers first.
- Exactly one (general) line and one ({member}) line for every member with an update.
- Name members by their member id.
- If there are no status updates, answer with exactly: {sentinel}
- Only use information from the tool results."#,
        listing = AgentTool::StatusUpdates.name(),
        member = MEMBER_SCOPE,
        sentinel = NO_ACTIVITY_SENTINEL,
    )
}

pub fn status_summary_user_prompt(
    organization_id: &str,
    team_id: Option<&str>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> String {
    let subject = match team_id {
        Some(team) => format!("team {team} in organization {organization_id}"),
        None => format!("organization {organization_id}"),
    };
    format!(
        "Create a status summary for {subject}.\n\
         effectiveFrom: {}\neffectiveTo: {}",
        from.to_rfc3339_opts(SecondsFormat::Secs, true),
        to.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_name_the_tools_and_sentinel() {
        let prompt = status_update_system_prompt(&[Provider::Github, Provider::Slack]);
        assert!(prompt.contains("listGitHubEvents, listSlackEvents"));
        assert!(prompt.contains(NO_ACTIVITY_SENTINEL));

        let prompt = activity_summary_system_prompt(Provider::Linear);
        assert!(prompt.contains("(project)"));
        assert!(prompt.contains("getLinearTarget"));
        assert!(prompt.contains("(team)"));
        assert!(!activity_summary_system_prompt(Provider::Github).contains("(team)"));

        let prompt = status_update_system_prompt(&[Provider::Slack]);
        assert!(prompt.contains("getExistingStatusUpdateItems first"));

        let prompt = status_summary_system_prompt(Some("platform"));
        assert!(prompt.contains("listStatusUpdates"));
        assert!(prompt.contains("(user)"));
        assert!(status_summary_user_prompt("org_1", Some("platform"), Utc::now(), Utc::now()).contains("team platform"));
    }
}
