//! Hand-off of touched event ids to the downstream processing queue.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use pulse_store::{Event, Store};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Downstream consumer of event ids.
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn send_batch(&self, ids: Vec<String>) -> Result<()>;
}

/// In-process queue backed by a bounded tokio channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<Vec<String>>,
}

impl ChannelQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<String>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventQueue for ChannelQueue {
    async fn send_batch(&self, ids: Vec<String>) -> Result<()> {
        self.tx
            .send(ids)
            .await
            .map_err(|_| anyhow!("event queue receiver dropped"))
    }
}

/// Batches ids and sends them best-effort.
///
/// A failed batch is logged and dropped; the next sync touches the same
/// events again, so delivery is at-least-once across runs.
#[derive(Clone)]
pub struct EventFanout {
    queue: Arc<dyn EventQueue>,
    batch_size: usize,
}

impl EventFanout {
    pub fn new(queue: Arc<dyn EventQueue>, batch_size: usize) -> Self {
        Self {
            queue,
            batch_size: batch_size.max(1),
        }
    }

    /// Returns how many ids were handed to the queue.
    pub async fn dispatch(&self, event_ids: &[i64]) -> usize {
        if event_ids.is_empty() {
            return 0;
        }

        let mut sent = 0;
        for chunk in event_ids.chunks(self.batch_size) {
            let batch: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
            match self.queue.send_batch(batch).await {
                Ok(()) => sent += chunk.len(),
                Err(e) => warn!("Failed to enqueue {} events: {}", chunk.len(), e),
            }
        }
        info!("Queued {} of {} touched events", sent, event_ids.len());
        sent
    }
}

// Checked in order; the first string wins.
const HEADLINE_POINTERS: &[&str] = &[
    "/title",
    "/text",
    "/content",
    "/payload/pull_request/title",
    "/payload/issue/title",
    "/payload/comment/body",
    "/payload/release/name",
];

const MAX_PROJECTION_CHARS: usize = 500;

/// Text stored in `event_vectors` for one event.
pub fn projection_text(event: &Event) -> String {
    let mut text = event.kind.clone();
    if let Some(action) = &event.action {
        text.push(' ');
        text.push_str(action);
    }
    let headline = HEADLINE_POINTERS
        .iter()
        .filter_map(|p| event.payload.pointer(p).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty());
    if let Some(headline) = headline {
        text.push_str(": ");
        text.push_str(headline);
    }
    text.chars().take(MAX_PROJECTION_CHARS).collect()
}

/// In-process consumer of the queue: projects each event and marks it processed.
pub struct EventProjector {
    store: Store,
}

impl EventProjector {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns how many events were projected. Unknown or malformed ids are skipped.
    pub async fn project_batch(&self, ids: &[String]) -> Result<usize> {
        let mut projected = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = raw.parse::<i64>() else {
                warn!("Skipping malformed event id {:?}", raw);
                continue;
            };
            let Some(event) = self.store.get_event(id).await? else {
                debug!("Event {} no longer exists", id);
                continue;
            };
            self.store.upsert_event_vector(id, &projection_text(&event)).await?;
            projected.push(id);
        }
        self.store.mark_events_processed(&projected).await?;
        Ok(projected.len())
    }

    /// Drain the channel until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<Vec<String>>) -> usize {
        let mut total = 0;
        while let Some(batch) = rx.recv().await {
            match self.project_batch(&batch).await {
                Ok(n) => total += n,
                Err(e) => warn!("Failed to project {} events: {:#}", batch.len(), e),
            }
        }
        total
    }
}
