//! Durable, resumable multi-step sync for one integration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulse_store::{Provider, Store, SyncRun, SyncRunStatus};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fanout::EventFanout;
use crate::providers::{start_of_week, ProviderRegistry, ProviderSync, StepContext};
use crate::sync::{AdapterReport, StatusReporter};

#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    /// Lower bound for event listings; defaults to the start of the current week.
    pub min_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StepSummary {
    pub step: String,
    pub report: AdapterReport,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub run_id: i64,
    pub integration_id: i64,
    pub provider: Provider,
    pub steps: Vec<StepSummary>,
    pub events_queued: usize,
}

struct StepFailure {
    step: String,
    error: SyncError,
}

impl StepFailure {
    fn at(step: &str, error: SyncError) -> Self {
        Self {
            step: step.to_string(),
            error,
        }
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Store,
    registry: Arc<ProviderRegistry>,
    fanout: Option<EventFanout>,
    max_pages: usize,
    step_timeout: Duration,
}

impl SyncOrchestrator {
    pub fn new(store: Store, registry: Arc<ProviderRegistry>, config: &SyncConfig) -> Self {
        Self {
            store,
            registry,
            fanout: None,
            max_pages: config.max_pages.max(1),
            step_timeout: Duration::from_secs(config.step_timeout_secs),
        }
    }

    pub fn with_fanout(mut self, fanout: EventFanout) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Claim the integration and run every step from the first.
    pub async fn start(&self, integration_id: i64, request: SyncRequest) -> Result<SyncOutcome, SyncError> {
        let integration = self
            .store
            .get_integration(integration_id)
            .await?
            .ok_or(SyncError::MissingIntegration(integration_id))?;
        let sync = self.provider_sync(integration.provider)?;

        let run = self
            .store
            .claim_sync(integration_id, request.min_event_at)
            .await?
            .ok_or(SyncError::AlreadyRunning(integration_id))?;

        info!(
            "Starting {} sync for integration {} (run {})",
            integration.provider.display_name(),
            integration_id,
            run.id
        );
        self.drive(run, sync).await
    }

    /// Continue a persisted run from its step cursor.
    pub async fn resume(&self, run_id: i64) -> Result<SyncOutcome, SyncError> {
        let run = self
            .store
            .get_sync_run(run_id)
            .await?
            .ok_or(SyncError::UnknownSyncRun(run_id))?;

        if run.status == SyncRunStatus::Completed {
            info!("Sync run {} already completed", run_id);
            return Ok(SyncOutcome {
                run_id,
                integration_id: run.integration_id,
                provider: run.provider,
                steps: Vec::new(),
                events_queued: 0,
            });
        }

        if self.store.get_integration(run.integration_id).await?.is_none() {
            return Err(SyncError::MissingIntegration(run.integration_id));
        }
        let sync = self.provider_sync(run.provider)?;

        let run = self
            .store
            .reclaim_sync(run_id, Utc::now() - self.stale_after())
            .await?
            .ok_or(SyncError::AlreadyRunning(run.integration_id))?;

        info!("Resuming sync run {} at step {}", run.id, run.next_step);
        self.drive(run, sync).await
    }

    /// Sync several integrations concurrently; steps within each stay sequential.
    pub async fn sync_many(
        &self,
        integration_ids: &[i64],
        request: SyncRequest,
    ) -> Vec<(i64, Result<SyncOutcome, SyncError>)> {
        let mut tasks = JoinSet::new();
        for &integration_id in integration_ids {
            let orchestrator = self.clone();
            let request = request.clone();
            tasks.spawn(async move {
                let result = orchestrator.start(integration_id, request).await;
                (integration_id, result)
            });
        }

        let mut results = Vec::with_capacity(integration_ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("Sync task panicked or was cancelled: {}", e),
            }
        }
        results.sort_by_key(|(id, _)| *id);
        results
    }

    fn provider_sync(&self, provider: Provider) -> Result<Arc<dyn ProviderSync>, SyncError> {
        self.registry.get(provider).ok_or_else(|| {
            SyncError::Config(format!("{} sync is not enabled", provider.display_name()))
        })
    }

    /// A held marker whose heartbeat is older than this belongs to a dead driver.
    fn stale_after(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.step_timeout)
            .unwrap_or_else(|_| ChronoDuration::days(1))
            + ChronoDuration::seconds(60)
    }

    /// Any error, from a step or from the store, fails the run and releases the marker.
    async fn drive(&self, run: SyncRun, sync: Arc<dyn ProviderSync>) -> Result<SyncOutcome, SyncError> {
        match self.drive_steps(&run, sync.as_ref()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!("Sync run {} failed at step {}: {}", run.id, err.step, err.error);
                if let Err(store_err) = self.store.fail_sync_run(run.id, &err.error.to_string()).await {
                    warn!("Failed to mark sync run {} failed: {}", run.id, store_err);
                }
                Err(err.error)
            }
        }
    }

    async fn drive_steps(&self, run: &SyncRun, sync: &dyn ProviderSync) -> Result<SyncOutcome, StepFailure> {
        let min_event_at = run
            .min_event_at
            .unwrap_or_else(|| start_of_week(Utc::now()));
        let mut outcome = SyncOutcome {
            run_id: run.id,
            integration_id: run.integration_id,
            provider: run.provider,
            steps: Vec::new(),
            events_queued: 0,
        };

        for (index, step) in sync.steps().iter().enumerate().skip(run.next_step) {
            let report = self
                .run_step(run, sync, step, min_event_at)
                .await
                .map_err(|e| StepFailure::at(step, e))?;
            if let Some(fanout) = &self.fanout {
                outcome.events_queued += fanout.dispatch(&report.touched_event_ids).await;
            }
            self.store
                .advance_sync_run(run.id, index + 1)
                .await
                .map_err(|e| StepFailure::at(step, e.into()))?;
            outcome.steps.push(StepSummary {
                step: step.to_string(),
                report,
            });
        }

        self.store
            .complete_sync_run(run.id)
            .await
            .map_err(|e| StepFailure::at("complete", e.into()))?;
        info!(
            "Sync run {} complete: {} steps, {} events queued",
            run.id,
            outcome.steps.len(),
            outcome.events_queued
        );
        Ok(outcome)
    }

    async fn run_step(
        &self,
        run: &SyncRun,
        sync: &dyn ProviderSync,
        step: &str,
        min_event_at: DateTime<Utc>,
    ) -> Result<AdapterReport, SyncError> {
        let integration = self
            .store
            .get_integration(run.integration_id)
            .await?
            .ok_or(SyncError::MissingIntegration(run.integration_id))?;

        let ctx = StepContext {
            store: &self.store,
            integration: &integration,
            min_event_at,
            max_pages: self.max_pages,
        };
        let timeout = self.step_timeout;

        info!("Sync run {}: step {}", run.id, step);
        StatusReporter::new(&self.store, integration.id)
            .report(async {
                tokio::time::timeout(timeout, sync.run_step(&ctx, step))
                    .await
                    .map_err(|_| SyncError::StepTimeout {
                        step: step.to_string(),
                        secs: timeout.as_secs(),
                    })?
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::ChannelQueue;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use pulse_store::{EventRow, NewIntegration};
    use serde_json::json;
    use std::sync::Mutex;

    /// Three-step provider whose behaviour per step is scripted.
    struct ScriptedSync {
        calls: Mutex<Vec<String>>,
        fail_step: Mutex<Option<&'static str>>,
        slow_step: Option<&'static str>,
    }

    impl ScriptedSync {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_step: Mutex::new(None),
                slow_step: None,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderSync for ScriptedSync {
        fn provider(&self) -> Provider {
            Provider::Slack
        }

        fn steps(&self) -> &'static [&'static str] {
            &["channels", "users", "messages"]
        }

        async fn run_step(&self, ctx: &StepContext<'_>, step: &str) -> Result<AdapterReport, SyncError> {
            self.calls.lock().unwrap().push(step.to_string());
            if self.slow_step == Some(step) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let fail_step = *self.fail_step.lock().unwrap();
            if fail_step == Some(step) {
                return Err(SyncError::Provider(ProviderError::Rejected {
                    provider: "slack",
                    endpoint: "users.list".to_string(),
                    message: "ratelimited".to_string(),
                }));
            }

            let mut report = AdapterReport::default();
            if step == "messages" {
                let rows = vec![EventRow {
                    external_id: format!("slack:T1:C1:{}", ctx.integration.id),
                    kind: "message".to_string(),
                    action: None,
                    target_external_id: Some("C1".to_string()),
                    actor_external_id: Some("U1".to_string()),
                    payload: json!({ "text": "hello" }),
                    occurred_at: ctx.min_event_at + chrono::Duration::minutes(1),
                }];
                report.touched_event_ids = ctx.store.apply_page(ctx.integration.id, &rows).await?;
            }
            Ok(report)
        }
    }

    async fn setup(sync: Arc<ScriptedSync>) -> (Store, SyncOrchestrator, i64) {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_1".to_string(),
                provider: Provider::Slack,
                credential: "xoxb".to_string(),
                external_account_id: Some("T1".to_string()),
            })
            .await
            .unwrap();
        let mut registry = ProviderRegistry::new();
        registry.register(sync);
        let orchestrator = SyncOrchestrator::new(store.clone(), Arc::new(registry), &SyncConfig::default());
        (store, orchestrator, integration.id)
    }

    #[tokio::test]
    async fn test_missing_integration_runs_no_step() {
        let sync = Arc::new(ScriptedSync::new());
        let (_, orchestrator, _) = setup(sync.clone()).await;

        let result = orchestrator.start(999, SyncRequest::default()).await;
        assert!(matches!(result, Err(SyncError::MissingIntegration(999))));
        assert!(sync.calls().is_empty());
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_clear_markers() {
        let sync = Arc::new(ScriptedSync::new());
        let (store, orchestrator, id) = setup(sync.clone()).await;
        let (queue, mut rx) = ChannelQueue::new(4);
        let orchestrator = orchestrator.with_fanout(EventFanout::new(Arc::new(queue), 10));

        let outcome = orchestrator.start(id, SyncRequest::default()).await.unwrap();
        assert_eq!(sync.calls(), vec!["channels", "users", "messages"]);
        assert_eq!(outcome.events_queued, 1);
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration.sync_id.is_none());
        assert!(integration.sync_started_at.is_none());
        assert!(integration.sync_error.is_none());
        assert!(integration.sync_finished_at.is_some());

        let run = store.get_sync_run(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!(run.next_step, 3);
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_refused() {
        let sync = Arc::new(ScriptedSync::new());
        let (store, orchestrator, id) = setup(sync).await;
        store.claim_sync(id, None).await.unwrap().unwrap();

        let result = orchestrator.start(id, SyncRequest::default()).await;
        assert!(matches!(result, Err(SyncError::AlreadyRunning(_))));
    }

    #[tokio::test]
    async fn test_failed_step_keeps_cursor_and_resume_continues() {
        let sync = Arc::new(ScriptedSync::new());
        *sync.fail_step.lock().unwrap() = Some("users");
        let (store, orchestrator, id) = setup(sync.clone()).await;

        let result = orchestrator.start(id, SyncRequest::default()).await;
        assert!(matches!(result, Err(SyncError::Provider(_))));

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration.sync_error.as_deref().unwrap().contains("ratelimited"));
        let run = store.latest_sync_run(id).await.unwrap().unwrap();
        let run_id = run.id;
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.next_step, 1);

        *sync.fail_step.lock().unwrap() = None;
        let outcome = orchestrator.resume(run_id).await.unwrap();
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(sync.calls(), vec!["channels", "users", "users", "messages"]);

        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration.sync_error.is_none());
        assert!(integration.sync_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_run_cannot_resume() {
        let sync = Arc::new(ScriptedSync::new());
        let (_, orchestrator, _) = setup(sync).await;
        assert!(matches!(
            orchestrator.resume(42).await,
            Err(SyncError::UnknownSyncRun(42))
        ));
    }

    #[tokio::test]
    async fn test_step_timeout_is_reported() {
        let mut scripted = ScriptedSync::new();
        scripted.slow_step = Some("channels");
        let sync = Arc::new(scripted);
        let (store, orchestrator, id) = setup(sync).await;
        let orchestrator = orchestrator.with_step_timeout(Duration::from_millis(20));

        let result = orchestrator.start(id, SyncRequest::default()).await;
        assert!(matches!(result, Err(SyncError::StepTimeout { .. })));
        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration.sync_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_resume_refuses_a_run_that_is_still_driving() {
        let mut scripted = ScriptedSync::new();
        scripted.slow_step = Some("channels");
        let sync = Arc::new(scripted);
        let (store, orchestrator, id) = setup(sync.clone()).await;

        let driver = orchestrator.clone();
        let handle = tokio::spawn(async move { driver.start(id, SyncRequest::default()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let run = store.latest_sync_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Running);
        assert!(matches!(
            orchestrator.resume(run.id).await,
            Err(SyncError::AlreadyRunning(_))
        ));
        assert_eq!(sync.calls(), vec!["channels"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_store_error_between_steps_fails_the_run() {
        let sync = Arc::new(ScriptedSync::new());
        let (store, orchestrator, id) = setup(sync.clone()).await;
        sqlx::query(
            "CREATE TRIGGER reject_advance BEFORE UPDATE OF next_step ON sync_runs \
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let result = orchestrator.start(id, SyncRequest::default()).await;
        assert!(matches!(result, Err(SyncError::Store(_))));
        assert_eq!(sync.calls(), vec!["channels"]);

        let run = store.latest_sync_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.next_step, 0);
        let integration = store.get_integration(id).await.unwrap().unwrap();
        assert!(integration.sync_id.is_none());
    }

    #[tokio::test]
    async fn test_zero_max_pages_still_fetches_one_page() {
        let config = SyncConfig {
            max_pages: 0,
            ..SyncConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(
            Store::in_memory().await.unwrap(),
            Arc::new(ProviderRegistry::new()),
            &config,
        );
        assert_eq!(orchestrator.max_pages, 1);
    }

    #[tokio::test]
    async fn test_sync_many_runs_each_integration() {
        let sync = Arc::new(ScriptedSync::new());
        let (store, orchestrator, first) = setup(sync.clone()).await;
        let second = store
            .upsert_integration(&NewIntegration {
                organization_id: "org_2".to_string(),
                provider: Provider::Slack,
                credential: "xoxb-2".to_string(),
                external_account_id: Some("T2".to_string()),
            })
            .await
            .unwrap()
            .id;

        let results = orchestrator
            .sync_many(&[first, second, 404], SyncRequest::default())
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_ok());
        assert!(matches!(results[2].1, Err(SyncError::MissingIntegration(404))));
        assert_eq!(sync.calls().len(), 6);
    }
}
