//! Integrations, the single-flight sync marker and persisted sync runs.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

use crate::models::{parse_opt_ts, parse_ts, ts};
use crate::{Integration, NewIntegration, Store, SyncRun, SyncRunStatus};

const INTEGRATION_COLUMNS: &str = "id, organization_id, provider, credential, external_account_id, \
    sync_id, sync_started_at, sync_finished_at, sync_updated_at, sync_error, sync_error_at, created_at";

const SYNC_RUN_COLUMNS: &str = "id, integration_id, provider, next_step, status, min_event_at, \
    last_error, started_at, updated_at, finished_at";

fn integration_from_row(row: &SqliteRow) -> Result<Integration> {
    let provider: String = row.try_get("provider")?;
    Ok(Integration {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        provider: provider.parse()?,
        credential: row.try_get("credential")?,
        external_account_id: row.try_get("external_account_id")?,
        sync_id: row.try_get("sync_id")?,
        sync_started_at: parse_opt_ts(row.try_get("sync_started_at")?)?,
        sync_finished_at: parse_opt_ts(row.try_get("sync_finished_at")?)?,
        sync_updated_at: parse_opt_ts(row.try_get("sync_updated_at")?)?,
        sync_error: row.try_get("sync_error")?,
        sync_error_at: parse_opt_ts(row.try_get("sync_error_at")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn sync_run_from_row(row: &SqliteRow) -> Result<SyncRun> {
    let provider: String = row.try_get("provider")?;
    let status: String = row.try_get("status")?;
    let next_step: i64 = row.try_get("next_step")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        integration_id: row.try_get("integration_id")?,
        provider: provider.parse()?,
        next_step: usize::try_from(next_step)?,
        status: status.parse()?,
        min_event_at: parse_opt_ts(row.try_get("min_event_at")?)?,
        last_error: row.try_get("last_error")?,
        started_at: parse_ts(&row.try_get::<String, _>("started_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
    })
}

impl Store {
    /// Create the integration for (organization, provider), or replace its credential.
    #[instrument(skip(self, new), fields(org = %new.organization_id, provider = %new.provider))]
    pub async fn upsert_integration(&self, new: &NewIntegration) -> Result<Integration> {
        let now = ts(&Utc::now());
        let row = sqlx::query(&format!(
            "INSERT INTO integrations (organization_id, provider, credential, external_account_id, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(organization_id, provider) DO UPDATE SET \
                credential = excluded.credential, \
                external_account_id = COALESCE(excluded.external_account_id, integrations.external_account_id) \
             RETURNING {INTEGRATION_COLUMNS}"
        ))
        .bind(&new.organization_id)
        .bind(new.provider.as_str())
        .bind(&new.credential)
        .bind(&new.external_account_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        integration_from_row(&row)
    }

    #[instrument(skip(self))]
    pub async fn get_integration(&self, id: i64) -> Result<Option<Integration>> {
        let row = sqlx::query(&format!(
            "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(integration_from_row).transpose()
    }

    /// All integrations, optionally restricted to one organization.
    pub async fn list_integrations(&self, organization_id: Option<&str>) -> Result<Vec<Integration>> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations WHERE organization_id = ? ORDER BY id"
                ))
                .bind(org)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {INTEGRATION_COLUMNS} FROM integrations ORDER BY id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(integration_from_row).collect()
    }

    /// Atomically take the single-flight marker and open a sync run.
    ///
    /// Returns `None` when another sync already holds the marker.
    #[instrument(skip(self))]
    pub async fn claim_sync(
        &self,
        integration_id: i64,
        min_event_at: Option<DateTime<Utc>>,
    ) -> Result<Option<SyncRun>> {
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let provider: Option<(String,)> =
            sqlx::query_as("SELECT provider FROM integrations WHERE id = ?")
                .bind(integration_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((provider,)) = provider else {
            return Err(anyhow!("integration {} not found", integration_id));
        };

        let row = sqlx::query(&format!(
            "INSERT INTO sync_runs (integration_id, provider, next_step, status, min_event_at, started_at, updated_at) \
             VALUES (?, ?, 0, ?, ?, ?, ?) RETURNING {SYNC_RUN_COLUMNS}"
        ))
        .bind(integration_id)
        .bind(&provider)
        .bind(SyncRunStatus::Running.as_str())
        .bind(min_event_at.as_ref().map(ts))
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;
        let run = sync_run_from_row(&row)?;

        let claimed = sqlx::query(
            "UPDATE integrations SET sync_id = ?, sync_started_at = ?, sync_updated_at = ? \
             WHERE id = ? AND sync_id IS NULL",
        )
        .bind(run.id)
        .bind(&now)
        .bind(&now)
        .bind(integration_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;
        Ok(Some(run))
    }

    /// Re-take the marker for an existing run.
    ///
    /// Succeeds when the marker is free, or when this run still holds it but
    /// the integration's last heartbeat is older than `stale_before` (the
    /// driving process died). A run that is still being driven is refused.
    #[instrument(skip(self))]
    pub async fn reclaim_sync(&self, run_id: i64, stale_before: DateTime<Utc>) -> Result<Option<SyncRun>> {
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(anyhow!("sync run {} not found", run_id));
        };
        let run = sync_run_from_row(&row)?;

        let claimed = sqlx::query(
            "UPDATE integrations SET sync_id = ?, sync_started_at = COALESCE(sync_started_at, ?), sync_updated_at = ? \
             WHERE id = ? AND (sync_id IS NULL OR \
                (sync_id = ? AND COALESCE(sync_updated_at, sync_started_at, '') < ?))",
        )
        .bind(run.id)
        .bind(&now)
        .bind(&now)
        .bind(run.integration_id)
        .bind(run.id)
        .bind(ts(&stale_before))
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("UPDATE sync_runs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(SyncRunStatus::Running.as_str())
            .bind(&now)
            .bind(run.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(SyncRun {
            status: SyncRunStatus::Running,
            ..run
        }))
    }

    pub async fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_run_from_row).transpose()
    }

    pub async fn latest_sync_run(&self, integration_id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE integration_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(integration_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_run_from_row).transpose()
    }

    /// Persist the step cursor after a step completed.
    #[instrument(skip(self))]
    pub async fn advance_sync_run(&self, run_id: i64, next_step: usize) -> Result<()> {
        sqlx::query("UPDATE sync_runs SET next_step = ?, updated_at = ? WHERE id = ?")
            .bind(i64::try_from(next_step)?)
            .bind(ts(&Utc::now()))
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark the run failed and release the marker so the run can be resumed.
    /// The integration's error fields are left as the status reporter set them.
    #[instrument(skip(self, error))]
    pub async fn fail_sync_run(&self, run_id: i64, error: &str) -> Result<()> {
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sync_runs SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(SyncRunStatus::Failed.as_str())
            .bind(error)
            .bind(&now)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE integrations SET sync_id = NULL WHERE sync_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close the run and clear the integration's in-flight markers.
    #[instrument(skip(self))]
    pub async fn complete_sync_run(&self, run_id: i64) -> Result<()> {
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE sync_runs SET status = ?, last_error = NULL, updated_at = ?, finished_at = ? WHERE id = ?",
        )
        .bind(SyncRunStatus::Completed.as_str())
        .bind(&now)
        .bind(&now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE integrations SET sync_finished_at = ?, sync_id = NULL, sync_started_at = NULL, \
                sync_error = NULL, sync_error_at = NULL \
             WHERE sync_id = ?",
        )
        .bind(&now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Heartbeat: stamp `sync_updated_at` and clear any recorded error.
    #[instrument(skip(self))]
    pub async fn record_sync_heartbeat(&self, integration_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE integrations SET sync_updated_at = ?, sync_error = NULL, sync_error_at = NULL WHERE id = ?",
        )
        .bind(ts(&Utc::now()))
        .bind(integration_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, message))]
    pub async fn record_sync_error(&self, integration_id: i64, message: &str) -> Result<()> {
        sqlx::query("UPDATE integrations SET sync_error = ?, sync_error_at = ? WHERE id = ?")
            .bind(message)
            .bind(ts(&Utc::now()))
            .bind(integration_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
