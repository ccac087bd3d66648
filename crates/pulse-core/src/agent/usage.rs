use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use pulse_store::{Store, UsageCharge, UsageKey};

use crate::config::UsageConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    StatusGeneration,
    SummaryGeneration,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::StatusGeneration => "status_generation",
            UsageKind::SummaryGeneration => "summary_generation",
        }
    }
}

/// Charges one generation against an organization's plan.
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn charge(&self, organization_id: &str, kind: UsageKind, plan: &str) -> Result<UsageCharge>;
}

/// Monthly counters in the store, limits from `[usage]`.
pub struct StoreUsageMeter {
    store: Store,
    config: UsageConfig,
}

impl StoreUsageMeter {
    pub fn new(store: Store, config: UsageConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl UsageMeter for StoreUsageMeter {
    async fn charge(&self, organization_id: &str, kind: UsageKind, plan: &str) -> Result<UsageCharge> {
        let limit = self
            .config
            .plan_limit(plan)
            .ok_or_else(|| anyhow!("unknown plan: {}", plan))?;
        let key = UsageKey::for_month(organization_id, kind.as_str(), plan, Utc::now());
        self.store.charge_usage(&key, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_meter_refuses_past_plan_limit() {
        let store = Store::in_memory().await.unwrap();
        let mut config = UsageConfig::default();
        config.plans.insert("tiny".to_string(), 1);
        let meter = StoreUsageMeter::new(store, config);

        assert!(meter.charge("org_1", UsageKind::StatusGeneration, "tiny").await.unwrap().is_charged());
        let second = meter.charge("org_1", UsageKind::SummaryGeneration, "tiny").await.unwrap();
        assert_eq!(second, UsageCharge::Refused { used: 1, limit: 1 });
        assert!(meter.charge("org_1", UsageKind::StatusGeneration, "platinum").await.is_err());
    }
}
