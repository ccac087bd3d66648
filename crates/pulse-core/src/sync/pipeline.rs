//! Generic fetch, map, upsert loop shared by every provider entity.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_store::{ReconcileScope, RowKind, Store, UpsertRow};
use tracing::{debug, info, warn};

use crate::error::{ProviderError, SyncError};
use crate::providers::Page;

/// Per-provider, per-entity knowledge plugged into [`run_adapter`].
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    type Record: Send;
    type Row: UpsertRow;

    /// Label for logs, e.g. `slack channels`.
    fn entity(&self) -> String;

    fn page_size(&self) -> usize;

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<Self::Record>, ProviderError>;

    /// Map one record, or give the reason it is dropped.
    fn map(&self, record: Self::Record) -> Result<Self::Row, &'static str>;

    /// Rows at or before this instant are dropped.
    fn lower_bound(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Listing is newest-first: the first out-of-window row ends pagination.
    fn stops_at_lower_bound(&self) -> bool {
        false
    }

    /// Present when the listing is exhaustive for this scope.
    fn reconcile_scope(&self) -> Option<ReconcileScope> {
        None
    }
}

/// What one adapter run (or a whole step) did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterReport {
    pub pages: usize,
    pub upserted: usize,
    pub dropped: usize,
    pub deleted: u64,
    /// The iteration ceiling cut the listing short.
    pub truncated: bool,
    /// Containers skipped after a transient provider failure.
    pub skipped: Vec<String>,
    pub touched_event_ids: Vec<i64>,
}

impl AdapterReport {
    pub fn merge(&mut self, other: AdapterReport) {
        self.pages += other.pages;
        self.upserted += other.upserted;
        self.dropped += other.dropped;
        self.deleted += other.deleted;
        self.truncated |= other.truncated;
        self.skipped.extend(other.skipped);
        self.touched_event_ids.extend(other.touched_event_ids);
    }

    /// Fold one container's result into the step report.
    ///
    /// Transient provider failures skip the container; anything else fails the step.
    pub fn absorb_container(
        &mut self,
        container: &str,
        result: Result<AdapterReport, SyncError>,
    ) -> Result<(), SyncError> {
        match result {
            Ok(report) => {
                self.merge(report);
                Ok(())
            }
            Err(SyncError::Provider(err)) if err.is_transient() => {
                warn!("Skipping {}: {}", container, err);
                self.skipped.push(container.to_string());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Paginate, map and upsert one listing.
///
/// `seen` is shared by every adapter run within one step so rows met in an
/// earlier container are not written twice.
pub async fn run_adapter<S: SyncStrategy>(
    store: &Store,
    integration_id: i64,
    strategy: &S,
    max_pages: usize,
    seen: &mut HashSet<String>,
) -> Result<AdapterReport, SyncError> {
    let entity = strategy.entity();
    let page_size = strategy.page_size();
    let lower_bound = strategy.lower_bound();

    let mut report = AdapterReport::default();
    let mut fetched: HashSet<String> = HashSet::new();
    let mut cursor: Option<String> = None;

    loop {
        if report.pages >= max_pages {
            warn!(
                "{}: stopped after {} pages (iteration ceiling), listing may be incomplete",
                entity, max_pages
            );
            report.truncated = true;
            break;
        }

        let page = strategy.fetch_page(cursor.as_deref(), page_size).await?;
        report.pages += 1;

        let mut rows = Vec::with_capacity(page.items.len());
        let mut reached_bound = false;
        for record in page.items {
            let row = match strategy.map(record) {
                Ok(row) => row,
                Err(reason) => {
                    debug!("{}: dropping record ({})", entity, reason);
                    report.dropped += 1;
                    continue;
                }
            };

            if let (Some(bound), Some(at)) = (lower_bound, row.occurred_at()) {
                if at <= bound {
                    report.dropped += 1;
                    reached_bound = true;
                    continue;
                }
            }

            fetched.insert(row.unique_key().to_string());
            if !seen.insert(row.unique_key().to_string()) {
                continue;
            }
            rows.push(row);
        }

        let ids = store.apply_page(integration_id, &rows).await?;
        report.upserted += ids.len();
        if <S::Row as UpsertRow>::KIND == RowKind::Event {
            report.touched_event_ids.extend(ids);
        }

        cursor = page.next_cursor;
        if cursor.is_none() || (reached_bound && strategy.stops_at_lower_bound()) {
            break;
        }
    }

    if let Some(scope) = strategy.reconcile_scope() {
        if report.truncated {
            warn!("{}: listing truncated, skipping reconciliation", entity);
        } else {
            report.deleted = store
                .delete_targets_not_in(integration_id, &scope, &fetched)
                .await?;
            if report.deleted > 0 {
                info!("{}: removed {} targets no longer listed", entity, report.deleted);
            }
        }
    }

    info!(
        "{}: {} pages, {} upserted, {} dropped",
        entity, report.pages, report.upserted, report.dropped
    );
    Ok(report)
}
