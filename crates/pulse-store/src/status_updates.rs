//! Member status updates, their ordered items and team membership.
//!
//! A generated update lands as a draft keyed by member and window. Saving the
//! same window again replaces its items but keeps the row, so a published
//! update stays published. Summaries only read published updates.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;

use crate::models::{parse_ts, ts};
use crate::Store;

const STATUS_UPDATE_COLUMNS: &str =
    "id, organization_id, member_id, effective_from, effective_to, is_draft, mood, notes, updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStatusItem {
    pub content: String,
    pub is_blocker: bool,
    pub is_in_progress: bool,
}

#[derive(Debug, Clone)]
pub struct NewStatusUpdate {
    pub organization_id: String,
    pub member_id: String,
    pub effective_from: DateTime<Utc>,
    pub effective_to: DateTime<Utc>,
    pub items: Vec<NewStatusItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusItem {
    pub content: String,
    pub is_blocker: bool,
    pub is_in_progress: bool,
    /// 1-based position inside the update.
    pub order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRecord {
    pub id: i64,
    pub organization_id: String,
    pub member_id: String,
    pub effective_from: DateTime<Utc>,
    pub effective_to: DateTime<Utc>,
    pub is_draft: bool,
    pub mood: Option<String>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<StatusItem>,
}

/// Updates whose window lies inside `[from, to]`.
#[derive(Debug, Clone)]
pub struct StatusUpdateFilter {
    pub organization_id: String,
    /// Only members of this team.
    pub team_id: Option<String>,
    pub member_id: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

fn status_update_from_row(row: &SqliteRow) -> Result<StatusUpdateRecord> {
    Ok(StatusUpdateRecord {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        member_id: row.try_get("member_id")?,
        effective_from: parse_ts(&row.try_get::<String, _>("effective_from")?)?,
        effective_to: parse_ts(&row.try_get::<String, _>("effective_to")?)?,
        is_draft: row.try_get::<i64, _>("is_draft")? != 0,
        mood: row.try_get("mood")?,
        notes: row.try_get("notes")?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        items: Vec::new(),
    })
}

impl Store {
    /// Store a generated update as a draft, replacing the items of any update
    /// the member already has for the same window. Returns the update id.
    #[instrument(skip(self, update), fields(org = %update.organization_id, member = %update.member_id))]
    pub async fn save_status_update(&self, update: &NewStatusUpdate) -> Result<i64> {
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO status_updates \
                (organization_id, member_id, effective_from, effective_to, is_draft, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT(organization_id, member_id, effective_from, effective_to) DO UPDATE SET \
                updated_at = excluded.updated_at \
             RETURNING id",
        )
        .bind(&update.organization_id)
        .bind(&update.member_id)
        .bind(ts(&update.effective_from))
        .bind(ts(&update.effective_to))
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM status_update_items WHERE status_update_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for (index, item) in update.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO status_update_items \
                    (status_update_id, content, is_blocker, is_in_progress, item_order) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&item.content)
            .bind(item.is_blocker)
            .bind(item.is_in_progress)
            .bind(i64::try_from(index + 1)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Mark an update final. Returns false when no such update exists.
    pub async fn publish_status_update(&self, id: i64, mood: Option<&str>, notes: Option<&str>) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE status_updates SET is_draft = 0, mood = COALESCE(?, mood), \
                notes = COALESCE(?, notes), updated_at = ? \
             WHERE id = ?",
        )
        .bind(mood)
        .bind(notes)
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Items of the member's update for exactly this window, draft or not.
    pub async fn status_items(
        &self,
        organization_id: &str,
        member_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatusItem>> {
        let rows = sqlx::query(
            "SELECT i.content, i.is_blocker, i.is_in_progress, i.item_order \
             FROM status_update_items i \
             JOIN status_updates s ON s.id = i.status_update_id \
             WHERE s.organization_id = ? AND s.member_id = ? \
               AND s.effective_from = ? AND s.effective_to = ? \
             ORDER BY i.item_order",
        )
        .bind(organization_id)
        .bind(member_id)
        .bind(ts(&from))
        .bind(ts(&to))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Published updates in the window, each with its items.
    #[instrument(skip(self, filter), fields(org = %filter.organization_id))]
    pub async fn list_status_updates(&self, filter: &StatusUpdateFilter) -> Result<Vec<StatusUpdateRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {STATUS_UPDATE_COLUMNS} FROM status_updates \
             WHERE organization_id = ? AND is_draft = 0 \
               AND effective_from >= ? AND effective_to <= ? \
               AND (? IS NULL OR member_id = ?) \
               AND (? IS NULL OR member_id IN \
                    (SELECT member_id FROM team_members WHERE organization_id = ? AND team_id = ?)) \
             ORDER BY member_id, effective_from"
        ))
        .bind(&filter.organization_id)
        .bind(ts(&filter.from))
        .bind(ts(&filter.to))
        .bind(&filter.member_id)
        .bind(&filter.member_id)
        .bind(&filter.team_id)
        .bind(&filter.organization_id)
        .bind(&filter.team_id)
        .fetch_all(&self.pool)
        .await?;

        let mut updates = rows.iter().map(status_update_from_row).collect::<Result<Vec<_>>>()?;
        for update in &mut updates {
            let items = sqlx::query(
                "SELECT content, is_blocker, is_in_progress, item_order FROM status_update_items \
                 WHERE status_update_id = ? ORDER BY item_order",
            )
            .bind(update.id)
            .fetch_all(&self.pool)
            .await?;
            update.items = items.iter().map(item_from_row).collect::<Result<_>>()?;
        }
        Ok(updates)
    }

    pub async fn add_team_member(&self, organization_id: &str, team_id: &str, member_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO team_members (organization_id, team_id, member_id) VALUES (?, ?, ?) \
             ON CONFLICT(organization_id, team_id, member_id) DO NOTHING",
        )
        .bind(organization_id)
        .bind(team_id)
        .bind(member_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn item_from_row(row: &SqliteRow) -> Result<StatusItem> {
    Ok(StatusItem {
        content: row.try_get("content")?,
        is_blocker: row.try_get::<i64, _>("is_blocker")? != 0,
        is_in_progress: row.try_get::<i64, _>("is_in_progress")? != 0,
        order: row.try_get("item_order")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn week() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 16, 23, 59, 59).unwrap(),
        )
    }

    fn update(member: &str, items: &[(&str, bool)]) -> NewStatusUpdate {
        let (from, to) = week();
        NewStatusUpdate {
            organization_id: "org_1".to_string(),
            member_id: member.to_string(),
            effective_from: from,
            effective_to: to,
            items: items
                .iter()
                .map(|(content, blocker)| NewStatusItem {
                    content: content.to_string(),
                    is_blocker: *blocker,
                    is_in_progress: false,
                })
                .collect(),
        }
    }

    fn filter() -> StatusUpdateFilter {
        let (from, to) = week();
        StatusUpdateFilter {
            organization_id: "org_1".to_string(),
            team_id: None,
            member_id: None,
            from,
            to,
        }
    }

    #[tokio::test]
    async fn test_resaving_a_window_replaces_items() {
        let store = Store::in_memory().await.unwrap();
        let first = store
            .save_status_update(&update("mem_1", &[("Shipped auth", false), ("Blocked on infra", true)]))
            .await
            .unwrap();
        let second = store
            .save_status_update(&update("mem_1", &[("Shipped auth and rate limits", false)]))
            .await
            .unwrap();
        assert_eq!(first, second);

        let (from, to) = week();
        let items = store.status_items("org_1", "mem_1", from, to).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "Shipped auth and rate limits");
        assert_eq!(items[0].order, 1);
        assert!(store.status_items("org_2", "mem_1", from, to).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_published_updates_are_listed() {
        let store = Store::in_memory().await.unwrap();
        let draft = store.save_status_update(&update("mem_1", &[("Draft work", false)])).await.unwrap();
        let published = store.save_status_update(&update("mem_2", &[("Done", false)])).await.unwrap();
        assert!(store.publish_status_update(published, Some("good"), None).await.unwrap());
        assert!(!store.publish_status_update(999, None, None).await.unwrap());

        let updates = store.list_status_updates(&filter()).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].member_id, "mem_2");
        assert_eq!(updates[0].mood.as_deref(), Some("good"));
        assert_eq!(updates[0].items[0].content, "Done");

        // A regenerated draft of a published window stays published.
        store.save_status_update(&update("mem_2", &[("Done again", false)])).await.unwrap();
        let updates = store.list_status_updates(&filter()).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].items[0].content, "Done again");
        assert_ne!(draft, published);
    }

    #[tokio::test]
    async fn test_team_filter_uses_membership() {
        let store = Store::in_memory().await.unwrap();
        for member in ["mem_1", "mem_2"] {
            let id = store.save_status_update(&update(member, &[("Work", false)])).await.unwrap();
            store.publish_status_update(id, None, None).await.unwrap();
        }
        store.add_team_member("org_1", "platform", "mem_2").await.unwrap();
        store.add_team_member("org_1", "platform", "mem_2").await.unwrap();

        let mut team = filter();
        team.team_id = Some("platform".to_string());
        let updates = store.list_status_updates(&team).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].member_id, "mem_2");

        team.team_id = Some("design".to_string());
        assert!(store.list_status_updates(&team).await.unwrap().is_empty());
    }
}
