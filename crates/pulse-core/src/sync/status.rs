use std::future::Future;

use pulse_store::Store;
use tracing::warn;

use crate::error::SyncError;

/// Records start, success and failure of one sync step on the integration row.
///
/// At rest either the error fields are set or they are clear, never a mix.
pub struct StatusReporter<'a> {
    store: &'a Store,
    integration_id: i64,
}

impl<'a> StatusReporter<'a> {
    pub fn new(store: &'a Store, integration_id: i64) -> Self {
        Self {
            store,
            integration_id,
        }
    }

    pub async fn report<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        self.store.record_sync_heartbeat(self.integration_id).await?;

        match op.await {
            Ok(value) => {
                self.store.record_sync_heartbeat(self.integration_id).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(store_err) = self
                    .store
                    .record_sync_error(self.integration_id, &err.to_string())
                    .await
                {
                    warn!(
                        "Failed to record sync error for integration {}: {}",
                        self.integration_id, store_err
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use pulse_store::{NewIntegration, Provider};

    async fn setup() -> (Store, i64) {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Linear,
                credential: "lin_api".to_string(),
                external_account_id: None,
            })
            .await
            .unwrap();
        (store, integration.id)
    }

    #[tokio::test]
    async fn test_failure_records_error_and_reraises() {
        let (store, id) = setup().await;
        let reporter = StatusReporter::new(&store, id);

        let result: Result<(), SyncError> = reporter
            .report(async {
                Err(SyncError::Provider(ProviderError::Rejected {
                    provider: "linear",
                    endpoint: "issues".to_string(),
                    message: "authentication required".to_string(),
                }))
            })
            .await;
        assert!(matches!(result, Err(SyncError::Provider(_))));

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration
            .sync_error
            .as_deref()
            .unwrap()
            .contains("authentication required"));
        assert!(integration.sync_error_at.is_some());
    }

    #[tokio::test]
    async fn test_success_clears_previous_error() {
        let (store, id) = setup().await;
        store.record_sync_error(id, "stale failure").await.unwrap();

        let reporter = StatusReporter::new(&store, id);
        let value = reporter.report(async { Ok::<_, SyncError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration.sync_error.is_none());
        assert!(integration.sync_error_at.is_none());
        assert!(integration.sync_updated_at.is_some());
    }
}
