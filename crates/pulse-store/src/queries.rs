//! Read side used by the agent tools. Every query is scoped to one organization.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

use crate::models::{parse_json, parse_opt_ts, parse_ts, ts};
use crate::{Event, Provider, ProviderUser, Store, SyncTarget, TargetKind};

/// Organization member linked to their user id on one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberIdentity {
    pub organization_id: String,
    pub member_id: String,
    pub provider: Provider,
    pub external_user_id: String,
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    pub organization_id: String,
    pub provider: Provider,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub actor_external_id: Option<String>,
    /// Empty means every target; otherwise only events on one of these.
    pub target_external_ids: Vec<String>,
    pub limit: usize,
}

/// Listing row handed to the model. Carries no raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub event_id: i64,
    pub external_id: String,
    pub kind: String,
    pub action: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub summary: Option<String>,
    pub actor: Option<String>,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetail {
    pub event: Event,
    pub summary: Option<String>,
    pub actor: Option<String>,
    pub target: Option<String>,
}

// Prefer the processed projection, fall back to the payload's own headline.
const SUMMARY_EXPR: &str = "substr(COALESCE(v.embedding_text, json_extract(e.payload, '$.title'), \
    json_extract(e.payload, '$.text')), 1, 500)";

const ACTOR_EXPR: &str = "(SELECT COALESCE(u.display_name, u.username) FROM provider_users u \
    WHERE u.integration_id = e.integration_id AND u.external_user_id = e.actor_external_id)";

const TARGET_EXPR: &str = "(SELECT t.name FROM sync_targets t \
    WHERE t.integration_id = e.integration_id AND t.external_id = e.target_external_id LIMIT 1)";

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    Ok(Event {
        id: row.try_get("id")?,
        integration_id: row.try_get("integration_id")?,
        external_id: row.try_get("external_id")?,
        kind: row.try_get("kind")?,
        action: row.try_get("action")?,
        target_external_id: row.try_get("target_external_id")?,
        actor_external_id: row.try_get("actor_external_id")?,
        payload: parse_json(&row.try_get::<String, _>("payload")?),
        occurred_at: parse_ts(&row.try_get::<String, _>("occurred_at")?)?,
        processed: row.try_get("processed")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn user_from_row(row: &SqliteRow) -> Result<ProviderUser> {
    Ok(ProviderUser {
        id: row.try_get("id")?,
        integration_id: row.try_get("integration_id")?,
        external_user_id: row.try_get("external_user_id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        avatar_url: row.try_get("avatar_url")?,
        is_bot: row.try_get("is_bot")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        scopes: row.try_get("scopes")?,
        token_expires_at: parse_opt_ts(row.try_get("token_expires_at")?)?,
        is_installer: row.try_get("is_installer")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn target_from_row(row: &SqliteRow) -> Result<SyncTarget> {
    let kind: String = row.try_get("kind")?;
    Ok(SyncTarget {
        id: row.try_get("id")?,
        integration_id: row.try_get("integration_id")?,
        kind: kind.parse()?,
        external_id: row.try_get("external_id")?,
        parent_external_id: row.try_get("parent_external_id")?,
        name: row.try_get("name")?,
        metadata: parse_json(&row.try_get::<String, _>("metadata")?),
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

impl Store {
    /// Recency-ordered, bounded page of events for one organization and provider.
    #[instrument(skip(self, filter), fields(org = %filter.organization_id, provider = %filter.provider))]
    pub async fn list_events(&self, filter: &EventFilter) -> Result<Vec<EventSummary>> {
        let target_clause = if filter.target_external_ids.is_empty() {
            String::new()
        } else {
            let placeholders = vec!["?"; filter.target_external_ids.len()].join(", ");
            format!("AND e.target_external_id IN ({placeholders})")
        };
        let sql = format!(
            "SELECT e.id, e.external_id, e.kind, e.action, e.occurred_at, \
                {SUMMARY_EXPR} AS summary, {ACTOR_EXPR} AS actor, {TARGET_EXPR} AS target \
             FROM events e \
             JOIN integrations i ON i.id = e.integration_id \
             LEFT JOIN event_vectors v ON v.event_id = e.id \
             WHERE i.organization_id = ? AND i.provider = ? \
               AND e.occurred_at >= ? AND e.occurred_at <= ? \
               AND (? IS NULL OR e.actor_external_id = ?) \
               {target_clause} \
             ORDER BY e.occurred_at DESC, e.id DESC \
             LIMIT ?"
        );
        let mut query = sqlx::query(&sql)
            .bind(&filter.organization_id)
            .bind(filter.provider.as_str())
            .bind(ts(&filter.from))
            .bind(ts(&filter.to))
            .bind(&filter.actor_external_id)
            .bind(&filter.actor_external_id);
        for target in &filter.target_external_ids {
            query = query.bind(target);
        }
        let rows = query
            .bind(i64::try_from(filter.limit)?)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(EventSummary {
                    event_id: row.try_get("id")?,
                    external_id: row.try_get("external_id")?,
                    kind: row.try_get("kind")?,
                    action: row.try_get("action")?,
                    occurred_at: parse_ts(&row.try_get::<String, _>("occurred_at")?)?,
                    summary: row.try_get("summary")?,
                    actor: row.try_get("actor")?,
                    target: row.try_get("target")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn get_event_detail(
        &self,
        organization_id: &str,
        provider: Provider,
        event_id: i64,
    ) -> Result<Option<EventDetail>> {
        let sql = format!(
            "SELECT e.id, e.integration_id, e.external_id, e.kind, e.action, e.target_external_id, \
                e.actor_external_id, e.payload, e.occurred_at, e.processed, e.created_at, e.updated_at, \
                {SUMMARY_EXPR} AS summary, {ACTOR_EXPR} AS actor, {TARGET_EXPR} AS target \
             FROM events e \
             JOIN integrations i ON i.id = e.integration_id \
             LEFT JOIN event_vectors v ON v.event_id = e.id \
             WHERE e.id = ? AND i.organization_id = ? AND i.provider = ?"
        );
        let row = sqlx::query(&sql)
            .bind(event_id)
            .bind(organization_id)
            .bind(provider.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(EventDetail {
            event: event_from_row(&row)?,
            summary: row.try_get("summary")?,
            actor: row.try_get("actor")?,
            target: row.try_get("target")?,
        }))
    }

    /// Unscoped lookup for the downstream processor.
    pub async fn get_event(&self, event_id: i64) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    pub async fn get_provider_user(
        &self,
        organization_id: &str,
        provider: Provider,
        external_user_id: &str,
    ) -> Result<Option<ProviderUser>> {
        let row = sqlx::query(
            "SELECT u.* FROM provider_users u \
             JOIN integrations i ON i.id = u.integration_id \
             WHERE i.organization_id = ? AND i.provider = ? AND u.external_user_id = ?",
        )
        .bind(organization_id)
        .bind(provider.as_str())
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn get_target(
        &self,
        organization_id: &str,
        provider: Provider,
        external_id: &str,
    ) -> Result<Option<SyncTarget>> {
        let row = sqlx::query(
            "SELECT t.* FROM sync_targets t \
             JOIN integrations i ON i.id = t.integration_id \
             WHERE i.organization_id = ? AND i.provider = ? AND t.external_id = ? \
             ORDER BY t.id LIMIT 1",
        )
        .bind(organization_id)
        .bind(provider.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(target_from_row).transpose()
    }

    pub async fn list_targets(&self, integration_id: i64, kind: Option<TargetKind>) -> Result<Vec<SyncTarget>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_targets WHERE integration_id = ? AND (? IS NULL OR kind = ?) ORDER BY kind, name",
        )
        .bind(integration_id)
        .bind(kind.map(|k| k.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(target_from_row).collect()
    }

    /// Users keyed by external id, for adapters that need local lookups.
    pub async fn list_provider_users(&self, integration_id: i64) -> Result<Vec<ProviderUser>> {
        let rows = sqlx::query("SELECT * FROM provider_users WHERE integration_id = ? ORDER BY username")
            .bind(integration_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn count_events(&self, integration_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE integration_id = ?")
            .bind(integration_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self, identity), fields(member = %identity.member_id, provider = %identity.provider))]
    pub async fn link_member_identity(&self, identity: &MemberIdentity) -> Result<()> {
        sqlx::query(
            "INSERT INTO member_identities (organization_id, member_id, provider, external_user_id) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(organization_id, member_id, provider) DO UPDATE SET \
                external_user_id = excluded.external_user_id",
        )
        .bind(&identity.organization_id)
        .bind(&identity.member_id)
        .bind(identity.provider.as_str())
        .bind(&identity.external_user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn member_identities(&self, organization_id: &str, member_id: &str) -> Result<Vec<MemberIdentity>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT provider, external_user_id FROM member_identities \
             WHERE organization_id = ? AND member_id = ? ORDER BY provider",
        )
        .bind(organization_id)
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(provider, external_user_id)| {
                Ok(MemberIdentity {
                    organization_id: organization_id.to_string(),
                    member_id: member_id.to_string(),
                    provider: provider.parse()?,
                    external_user_id,
                })
            })
            .collect()
    }
}
