use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, SqlitePool};
use tracing::instrument;

mod integrations;
mod models;
mod queries;
mod status_updates;
mod upsert;
mod usage;

pub use models::{
    Event, EventRow, Integration, NewIntegration, Provider, ProviderUser, SyncRun, SyncRunStatus,
    SyncTarget, TargetKind, TargetRow, UserRow,
};
pub use queries::{EventDetail, EventFilter, EventSummary, MemberIdentity};
pub use status_updates::{NewStatusItem, NewStatusUpdate, StatusItem, StatusUpdateFilter, StatusUpdateRecord};
pub use upsert::{ReconcileScope, RowKind, UpsertRow};
pub use usage::{UsageCharge, UsageKey, UsageSnapshot};

/// Handle to the normalized event store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Single-connection in-memory store; every handle shares the same database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS integrations (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                organization_id TEXT NOT NULL,\
                provider TEXT NOT NULL,\
                credential TEXT NOT NULL,\
                external_account_id TEXT,\
                sync_id INTEGER,\
                sync_started_at TEXT,\
                sync_finished_at TEXT,\
                sync_updated_at TEXT,\
                sync_error TEXT,\
                sync_error_at TEXT,\
                created_at TEXT NOT NULL,\
                UNIQUE(organization_id, provider)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_runs (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                integration_id INTEGER NOT NULL REFERENCES integrations(id) ON DELETE CASCADE,\
                provider TEXT NOT NULL,\
                next_step INTEGER NOT NULL DEFAULT 0,\
                status TEXT NOT NULL,\
                min_event_at TEXT,\
                last_error TEXT,\
                started_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                finished_at TEXT\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_targets (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                integration_id INTEGER NOT NULL REFERENCES integrations(id) ON DELETE CASCADE,\
                kind TEXT NOT NULL,\
                external_id TEXT NOT NULL,\
                parent_external_id TEXT,\
                name TEXT NOT NULL,\
                metadata TEXT NOT NULL,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                UNIQUE(integration_id, kind, external_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS provider_users (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                integration_id INTEGER NOT NULL REFERENCES integrations(id) ON DELETE CASCADE,\
                external_user_id TEXT NOT NULL,\
                username TEXT NOT NULL,\
                display_name TEXT,\
                email TEXT,\
                avatar_url TEXT,\
                is_bot INTEGER NOT NULL DEFAULT 0,\
                access_token TEXT,\
                refresh_token TEXT,\
                scopes TEXT,\
                token_expires_at TEXT,\
                is_installer INTEGER NOT NULL DEFAULT 0,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                UNIQUE(integration_id, external_user_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                integration_id INTEGER NOT NULL REFERENCES integrations(id) ON DELETE CASCADE,\
                external_id TEXT NOT NULL,\
                kind TEXT NOT NULL,\
                action TEXT,\
                target_external_id TEXT,\
                actor_external_id TEXT,\
                payload TEXT NOT NULL,\
                occurred_at TEXT NOT NULL,\
                processed INTEGER NOT NULL DEFAULT 0,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                UNIQUE(integration_id, external_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_occurred ON events(integration_id, occurred_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_actor ON events(integration_id, actor_external_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS event_vectors (\
                event_id INTEGER PRIMARY KEY REFERENCES events(id) ON DELETE CASCADE,\
                embedding_text TEXT NOT NULL,\
                created_at TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS member_identities (\
                organization_id TEXT NOT NULL,\
                member_id TEXT NOT NULL,\
                provider TEXT NOT NULL,\
                external_user_id TEXT NOT NULL,\
                PRIMARY KEY (organization_id, member_id, provider)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS status_updates (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                organization_id TEXT NOT NULL,\
                member_id TEXT NOT NULL,\
                effective_from TEXT NOT NULL,\
                effective_to TEXT NOT NULL,\
                is_draft INTEGER NOT NULL DEFAULT 1,\
                mood TEXT,\
                notes TEXT,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL,\
                UNIQUE (organization_id, member_id, effective_from, effective_to)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS status_update_items (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                status_update_id INTEGER NOT NULL REFERENCES status_updates(id) ON DELETE CASCADE,\
                content TEXT NOT NULL,\
                is_blocker INTEGER NOT NULL,\
                is_in_progress INTEGER NOT NULL,\
                item_order INTEGER NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS team_members (\
                organization_id TEXT NOT NULL,\
                team_id TEXT NOT NULL,\
                member_id TEXT NOT NULL,\
                PRIMARY KEY (organization_id, team_id, member_id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_counters (\
                organization_id TEXT NOT NULL,\
                usage_kind TEXT NOT NULL,\
                plan TEXT NOT NULL,\
                period TEXT NOT NULL,\
                count INTEGER NOT NULL,\
                updated_at TEXT NOT NULL,\
                PRIMARY KEY (organization_id, usage_kind, plan, period)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS usage_add_ons (\
                organization_id TEXT PRIMARY KEY,\
                remaining INTEGER NOT NULL,\
                updated_at TEXT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
