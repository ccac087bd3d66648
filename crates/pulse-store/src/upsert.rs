//! Idempotent page writes keyed by each row's external key.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, instrument};

use crate::models::ts;
use crate::{EventRow, Store, TargetKind, TargetRow, UserRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Target,
    User,
    Event,
}

/// A canonical row that can be written with `INSERT ... ON CONFLICT DO UPDATE`.
#[async_trait]
pub trait UpsertRow: Send + Sync {
    const KIND: RowKind;

    /// External key, unique within one integration (and target kind).
    fn unique_key(&self) -> &str;

    /// Event time for time-bounded collections.
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Write one row, returning the local row id.
    async fn upsert(&self, conn: &mut SqliteConnection, integration_id: i64, now: &str) -> Result<i64>;
}

/// Set of local targets a listing is exhaustive for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileScope {
    pub kind: TargetKind,
    /// Restrict to children of one parent (a Discord server); `None` covers the whole kind.
    pub parent_external_id: Option<String>,
}

impl ReconcileScope {
    pub fn kind(kind: TargetKind) -> Self {
        Self {
            kind,
            parent_external_id: None,
        }
    }

    pub fn child_of(kind: TargetKind, parent: impl Into<String>) -> Self {
        Self {
            kind,
            parent_external_id: Some(parent.into()),
        }
    }
}

#[async_trait]
impl UpsertRow for TargetRow {
    const KIND: RowKind = RowKind::Target;

    fn unique_key(&self) -> &str {
        &self.external_id
    }

    async fn upsert(&self, conn: &mut SqliteConnection, integration_id: i64, now: &str) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO sync_targets (integration_id, kind, external_id, parent_external_id, name, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(integration_id, kind, external_id) DO UPDATE SET \
                parent_external_id = excluded.parent_external_id, \
                name = excluded.name, \
                metadata = excluded.metadata, \
                updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(integration_id)
        .bind(self.kind.as_str())
        .bind(&self.external_id)
        .bind(&self.parent_external_id)
        .bind(&self.name)
        .bind(self.metadata.to_string())
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl UpsertRow for UserRow {
    const KIND: RowKind = RowKind::User;

    fn unique_key(&self) -> &str {
        &self.external_user_id
    }

    /// Secrets absent from the listing keep their stored values.
    async fn upsert(&self, conn: &mut SqliteConnection, integration_id: i64, now: &str) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO provider_users (integration_id, external_user_id, username, display_name, email, avatar_url, \
                is_bot, access_token, refresh_token, scopes, token_expires_at, is_installer, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, COALESCE(?, 0), ?, ?) \
             ON CONFLICT(integration_id, external_user_id) DO UPDATE SET \
                username = excluded.username, \
                display_name = excluded.display_name, \
                email = COALESCE(excluded.email, provider_users.email), \
                avatar_url = excluded.avatar_url, \
                is_bot = excluded.is_bot, \
                access_token = COALESCE(excluded.access_token, provider_users.access_token), \
                refresh_token = COALESCE(excluded.refresh_token, provider_users.refresh_token), \
                scopes = COALESCE(excluded.scopes, provider_users.scopes), \
                token_expires_at = COALESCE(excluded.token_expires_at, provider_users.token_expires_at), \
                is_installer = COALESCE(?, provider_users.is_installer), \
                updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(integration_id)
        .bind(&self.external_user_id)
        .bind(&self.username)
        .bind(&self.display_name)
        .bind(&self.email)
        .bind(&self.avatar_url)
        .bind(self.is_bot)
        .bind(&self.access_token)
        .bind(&self.refresh_token)
        .bind(&self.scopes)
        .bind(self.token_expires_at.as_ref().map(ts))
        .bind(self.is_installer)
        .bind(now)
        .bind(now)
        .bind(self.is_installer)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl UpsertRow for EventRow {
    const KIND: RowKind = RowKind::Event;

    fn unique_key(&self) -> &str {
        &self.external_id
    }

    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        Some(self.occurred_at)
    }

    /// `created_at` and `processed` are never rewritten.
    async fn upsert(&self, conn: &mut SqliteConnection, integration_id: i64, now: &str) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO events (integration_id, external_id, kind, action, target_external_id, actor_external_id, \
                payload, occurred_at, processed, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?) \
             ON CONFLICT(integration_id, external_id) DO UPDATE SET \
                kind = excluded.kind, \
                action = excluded.action, \
                target_external_id = excluded.target_external_id, \
                actor_external_id = excluded.actor_external_id, \
                payload = excluded.payload, \
                occurred_at = excluded.occurred_at, \
                updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(integration_id)
        .bind(&self.external_id)
        .bind(&self.kind)
        .bind(&self.action)
        .bind(&self.target_external_id)
        .bind(&self.actor_external_id)
        .bind(self.payload.to_string())
        .bind(ts(&self.occurred_at))
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }
}

impl Store {
    /// Upsert one fetched page in a single transaction. Returns the touched row ids.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn apply_page<R: UpsertRow>(&self, integration_id: i64, rows: &[R]) -> Result<Vec<i64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.upsert(&mut *tx, integration_id, &now).await?);
        }
        tx.commit().await?;
        debug!("Upserted {} {:?} rows for integration {}", ids.len(), R::KIND, integration_id);
        Ok(ids)
    }

    /// Delete local targets in `scope` whose external id is not in `keep`.
    #[instrument(skip(self, keep), fields(keep = keep.len()))]
    pub async fn delete_targets_not_in(
        &self,
        integration_id: i64,
        scope: &ReconcileScope,
        keep: &HashSet<String>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let existing: Vec<(i64, String)> = match &scope.parent_external_id {
            Some(parent) => {
                sqlx::query_as(
                    "SELECT id, external_id FROM sync_targets \
                     WHERE integration_id = ? AND kind = ? AND parent_external_id = ?",
                )
                .bind(integration_id)
                .bind(scope.kind.as_str())
                .bind(parent)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, external_id FROM sync_targets WHERE integration_id = ? AND kind = ?",
                )
                .bind(integration_id)
                .bind(scope.kind.as_str())
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let mut deleted = 0;
        for (id, external_id) in existing {
            if keep.contains(&external_id) {
                continue;
            }
            deleted += sqlx::query("DELETE FROM sync_targets WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(deleted)
    }

    /// Written by the downstream processor; read back by the agent tools.
    pub async fn upsert_event_vector(&self, event_id: i64, embedding_text: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO event_vectors (event_id, embedding_text, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(event_id) DO UPDATE SET embedding_text = excluded.embedding_text",
        )
        .bind(event_id)
        .bind(embedding_text)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_events_processed(&self, event_ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for id in event_ids {
            updated += sqlx::query("UPDATE events SET processed = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// OAuth access token of the user who installed the integration, if stored.
    pub async fn installer_token(&self, integration_id: i64) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT access_token FROM provider_users \
             WHERE integration_id = ? AND is_installer = 1 AND access_token IS NOT NULL \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(token,)| token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewIntegration, Provider};
    use serde_json::json;

    async fn setup() -> (Store, i64) {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Discord,
                credential: "bot-token".to_string(),
                external_account_id: None,
            })
            .await
            .unwrap();
        (store, integration.id)
    }

    fn channel(id: &str, server: &str, name: &str) -> TargetRow {
        TargetRow {
            kind: TargetKind::Channel,
            external_id: id.to_string(),
            parent_external_id: Some(server.to_string()),
            name: name.to_string(),
            metadata: json!({ "type": 0 }),
        }
    }

    fn event(id: &str, text: &str) -> EventRow {
        EventRow {
            external_id: id.to_string(),
            kind: "message".to_string(),
            action: Some("created".to_string()),
            target_external_id: Some("C1".to_string()),
            actor_external_id: Some("U1".to_string()),
            payload: json!({ "text": text }),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_apply_page_is_idempotent() {
        let (store, integration_id) = setup().await;
        let rows = vec![event("message_1", "hi"), event("message_2", "there")];

        let first = store.apply_page(integration_id, &rows).await.unwrap();
        let second = store.apply_page(integration_id, &rows).await.unwrap();
        assert_eq!(first, second);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_event_upsert_keeps_processed_and_created_at() {
        let (store, integration_id) = setup().await;
        let ids = store
            .apply_page(integration_id, &[event("message_1", "draft")])
            .await
            .unwrap();
        store.mark_events_processed(&ids).await.unwrap();
        let (created_before,): (String,) = sqlx::query_as("SELECT created_at FROM events WHERE id = ?")
            .bind(ids[0])
            .fetch_one(store.pool())
            .await
            .unwrap();

        store
            .apply_page(integration_id, &[event("message_1", "edited")])
            .await
            .unwrap();

        let (processed, created_after, payload): (bool, String, String) =
            sqlx::query_as("SELECT processed, created_at, payload FROM events WHERE id = ?")
                .bind(ids[0])
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert!(processed);
        assert_eq!(created_before, created_after);
        assert!(payload.contains("edited"));
    }

    #[tokio::test]
    async fn test_user_resync_preserves_secrets() {
        let (store, integration_id) = setup().await;
        let installer = UserRow {
            external_user_id: "U1".to_string(),
            username: "ada".to_string(),
            access_token: Some("oauth-access".to_string()),
            refresh_token: Some("oauth-refresh".to_string()),
            scopes: Some("identify guilds".to_string()),
            is_installer: Some(true),
            ..Default::default()
        };
        store.apply_page(integration_id, &[installer]).await.unwrap();

        let listing = UserRow {
            external_user_id: "U1".to_string(),
            username: "ada_l".to_string(),
            display_name: Some("Ada".to_string()),
            ..Default::default()
        };
        store.apply_page(integration_id, &[listing]).await.unwrap();

        let (username, access, refresh, scopes, is_installer): (String, Option<String>, Option<String>, Option<String>, bool) =
            sqlx::query_as(
                "SELECT username, access_token, refresh_token, scopes, is_installer FROM provider_users WHERE external_user_id = 'U1'",
            )
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(username, "ada_l");
        assert_eq!(access.as_deref(), Some("oauth-access"));
        assert_eq!(refresh.as_deref(), Some("oauth-refresh"));
        assert_eq!(scopes.as_deref(), Some("identify guilds"));
        assert!(is_installer);
        assert_eq!(
            store.installer_token(integration_id).await.unwrap().as_deref(),
            Some("oauth-access")
        );
    }

    #[tokio::test]
    async fn test_reconcile_only_touches_its_scope() {
        let (store, integration_id) = setup().await;
        store
            .apply_page(
                integration_id,
                &[
                    channel("c1", "g1", "general"),
                    channel("c2", "g1", "random"),
                    channel("c3", "g2", "other-server"),
                ],
            )
            .await
            .unwrap();

        let keep: HashSet<String> = ["c1".to_string()].into_iter().collect();
        let deleted = store
            .delete_targets_not_in(integration_id, &ReconcileScope::child_of(TargetKind::Channel, "g1"), &keep)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let remaining: Vec<(String,)> =
            sqlx::query_as("SELECT external_id FROM sync_targets ORDER BY external_id")
                .fetch_all(store.pool())
                .await
                .unwrap();
        let remaining: Vec<String> = remaining.into_iter().map(|(id,)| id).collect();
        assert_eq!(remaining, vec!["c1".to_string(), "c3".to_string()]);
    }
}
