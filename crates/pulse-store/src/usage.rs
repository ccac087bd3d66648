//! Monthly generation counters with non-expiring add-on credits.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::models::ts;
use crate::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageKey {
    pub organization_id: String,
    /// `status_generation`, `summary_generation`.
    pub kind: String,
    pub plan: String,
    /// `YYYY-MM`
    pub period: String,
}

impl UsageKey {
    pub fn for_month(organization_id: &str, kind: &str, plan: &str, at: DateTime<Utc>) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            kind: kind.to_string(),
            plan: plan.to_string(),
            period: at.format("%Y-%m").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCharge {
    /// One unit was recorded. `from_add_on` when the plan allowance was already spent.
    Charged { used: i64, from_add_on: bool },
    Refused { used: i64, limit: i64 },
}

impl UsageCharge {
    pub fn is_charged(&self) -> bool {
        matches!(self, UsageCharge::Charged { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub organization_id: String,
    pub period: String,
    pub by_kind: Vec<(String, i64)>,
    pub total: i64,
    pub add_on_remaining: i64,
}

impl Store {
    /// Charge one generation against the organization's monthly allowance.
    ///
    /// The allowance is shared by all usage kinds. Once it is spent, add-on
    /// credits are consumed one at a time. Every step is a single conditional
    /// statement, so concurrent charges cannot overshoot.
    #[instrument(skip(self, key), fields(org = %key.organization_id, kind = %key.kind, period = %key.period))]
    pub async fn charge_usage(&self, key: &UsageKey, plan_limit: i64) -> Result<UsageCharge> {
        let now = ts(&Utc::now());
        let plan = sqlx::query(
            "INSERT INTO usage_counters (organization_id, usage_kind, plan, period, count, updated_at) \
             SELECT ?, ?, ?, ?, 1, ? \
             WHERE (SELECT COALESCE(SUM(count), 0) FROM usage_counters \
                    WHERE organization_id = ? AND period = ?) < ? \
             ON CONFLICT(organization_id, usage_kind, plan, period) DO UPDATE SET \
                count = usage_counters.count + 1, \
                updated_at = excluded.updated_at",
        )
        .bind(&key.organization_id)
        .bind(&key.kind)
        .bind(&key.plan)
        .bind(&key.period)
        .bind(&now)
        .bind(&key.organization_id)
        .bind(&key.period)
        .bind(plan_limit)
        .execute(&self.pool)
        .await?;

        if plan.rows_affected() == 1 {
            let used = self.period_total(&key.organization_id, &key.period).await?;
            return Ok(UsageCharge::Charged {
                used,
                from_add_on: false,
            });
        }

        let add_on = sqlx::query(
            "UPDATE usage_add_ons SET remaining = remaining - 1, updated_at = ? \
             WHERE organization_id = ? AND remaining > 0",
        )
        .bind(&now)
        .bind(&key.organization_id)
        .execute(&self.pool)
        .await?;

        if add_on.rows_affected() == 1 {
            sqlx::query(
                "INSERT INTO usage_counters (organization_id, usage_kind, plan, period, count, updated_at) \
                 VALUES (?, ?, ?, ?, 1, ?) \
                 ON CONFLICT(organization_id, usage_kind, plan, period) DO UPDATE SET \
                    count = usage_counters.count + 1, \
                    updated_at = excluded.updated_at",
            )
            .bind(&key.organization_id)
            .bind(&key.kind)
            .bind(&key.plan)
            .bind(&key.period)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            let used = self.period_total(&key.organization_id, &key.period).await?;
            info!("Plan allowance spent, charged add-on credit ({} used)", used);
            return Ok(UsageCharge::Charged {
                used,
                from_add_on: true,
            });
        }

        let used = self.period_total(&key.organization_id, &key.period).await?;
        Ok(UsageCharge::Refused {
            used,
            limit: plan_limit,
        })
    }

    pub async fn grant_add_on_credits(&self, organization_id: &str, credits: i64) -> Result<i64> {
        let (remaining,): (i64,) = sqlx::query_as(
            "INSERT INTO usage_add_ons (organization_id, remaining, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(organization_id) DO UPDATE SET \
                remaining = usage_add_ons.remaining + excluded.remaining, \
                updated_at = excluded.updated_at \
             RETURNING remaining",
        )
        .bind(organization_id)
        .bind(credits)
        .bind(ts(&Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(remaining)
    }

    pub async fn usage_snapshot(&self, organization_id: &str, period: &str) -> Result<UsageSnapshot> {
        let by_kind: Vec<(String, i64)> = sqlx::query_as(
            "SELECT usage_kind, SUM(count) FROM usage_counters \
             WHERE organization_id = ? AND period = ? GROUP BY usage_kind ORDER BY usage_kind",
        )
        .bind(organization_id)
        .bind(period)
        .fetch_all(&self.pool)
        .await?;
        let add_on: Option<(i64,)> =
            sqlx::query_as("SELECT remaining FROM usage_add_ons WHERE organization_id = ?")
                .bind(organization_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(UsageSnapshot {
            organization_id: organization_id.to_string(),
            period: period.to_string(),
            total: by_kind.iter().map(|(_, count)| count).sum(),
            by_kind,
            add_on_remaining: add_on.map(|(r,)| r).unwrap_or(0),
        })
    }

    async fn period_total(&self, organization_id: &str, period: &str) -> Result<i64> {
        let (total,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(count), 0) FROM usage_counters WHERE organization_id = ? AND period = ?",
        )
        .bind(organization_id)
        .bind(period)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: &str) -> UsageKey {
        UsageKey {
            organization_id: "org_1".to_string(),
            kind: kind.to_string(),
            plan: "basic".to_string(),
            period: "2025-03".to_string(),
        }
    }

    #[tokio::test]
    async fn test_charge_refuses_past_plan_limit() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.charge_usage(&key("status_generation"), 2).await.unwrap().is_charged());
        assert!(store.charge_usage(&key("summary_generation"), 2).await.unwrap().is_charged());

        let refused = store.charge_usage(&key("status_generation"), 2).await.unwrap();
        assert_eq!(refused, UsageCharge::Refused { used: 2, limit: 2 });

        let snapshot = store.usage_snapshot("org_1", "2025-03").await.unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.by_kind.len(), 2);
    }

    #[tokio::test]
    async fn test_add_on_credits_extend_the_allowance() {
        let store = Store::in_memory().await.unwrap();
        store.grant_add_on_credits("org_1", 1).await.unwrap();

        assert!(store.charge_usage(&key("status_generation"), 1).await.unwrap().is_charged());
        let from_add_on = store.charge_usage(&key("status_generation"), 1).await.unwrap();
        assert_eq!(
            from_add_on,
            UsageCharge::Charged {
                used: 2,
                from_add_on: true
            }
        );
        assert!(!store.charge_usage(&key("status_generation"), 1).await.unwrap().is_charged());

        let snapshot = store.usage_snapshot("org_1", "2025-03").await.unwrap();
        assert_eq!(snapshot.add_on_remaining, 0);
    }

    #[tokio::test]
    async fn test_periods_are_independent() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.charge_usage(&key("status_generation"), 1).await.unwrap().is_charged());

        let mut next_month = key("status_generation");
        next_month.period = "2025-04".to_string();
        assert!(store.charge_usage(&next_month, 1).await.unwrap().is_charged());
    }
}
