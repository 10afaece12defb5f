//! Persister (§4.6): subscribes to `traffic:consolidated`, batches
//! inserts, and writes them to the relational store inside a single
//! transaction, falling back to a durable append-only queue on store
//! outage.

pub mod queue;
pub mod schema;
pub mod store;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{channels, Broker, BrokerJsonExt};
use crate::config::PersisterConfig;
use crate::error::{Classify, ErrorKind};
use crate::types::ConsolidatedEvent;

pub use queue::DurableQueue;
pub use store::{open_pooled, AnalyticsSummary, DetectionRow, SearchCriteria, SqlStore, StoreError};

#[derive(Debug, Error)]
pub enum PersisterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("durable queue I/O error: {0}")]
    Queue(#[from] std::io::Error),
}

impl Classify for PersisterError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

#[derive(Debug, Default)]
pub struct PersisterStats {
    pub total_persisted: AtomicU64,
    pub last_flush_at: AtomicI64,
}

pub struct Persister {
    broker: Arc<dyn Broker>,
    store: Arc<SqlStore>,
    queue: Arc<DurableQueue>,
    config: PersisterConfig,
    buffer: Mutex<Vec<ConsolidatedEvent>>,
    stats: Arc<PersisterStats>,
}

impl Persister {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<SqlStore>, config: PersisterConfig) -> Result<Self, PersisterError> {
        let queue = Arc::new(DurableQueue::open(config.durable_queue_path.clone())?);
        Ok(Persister {
            broker,
            store,
            queue,
            config,
            buffer: Mutex::new(Vec::new()),
            stats: Arc::new(PersisterStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<PersisterStats> {
        self.stats.clone()
    }

    /// Subscribes to `traffic:consolidated` and flushes the buffer
    /// whenever it reaches the configured batch size or the flush
    /// interval elapses, whichever first. On cancellation the buffer is
    /// flushed one last time before returning, honoring the bounded
    /// shutdown deadline from §5.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.broker.subscribe(channels::CONSOLIDATED);
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await;
                    info!(component = "persister", "shutting down, final flush complete");
                    return;
                }
                _ = ticker.tick() => {
                    self.flush().await;
                }
                msg = rx.recv() => match msg {
                    Ok(bytes) => {
                        match serde_json::from_slice::<ConsolidatedEvent>(&bytes) {
                            Ok(event) => self.push(event).await,
                            Err(e) => warn!(component = "persister", error = %e, "malformed consolidated event, skipping"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(component = "persister", skipped = n, "consolidated feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        self.flush().await;
                        return;
                    }
                }
            }
        }
    }

    async fn push(&self, event: ConsolidatedEvent) {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event);
            buffer.len() >= self.config.batch_size
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Flushes the buffer plus anything already in the durable queue.
    /// On transaction failure the batch is retried once; on a second
    /// failure it is appended to the durable queue rather than lost.
    pub async fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() && self.queue.depth() == 0 {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let recovered = if self.queue.depth() > 0 {
            self.queue.drain_all().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut to_persist = recovered;
        to_persist.extend(batch);
        if to_persist.is_empty() {
            return;
        }

        if self.try_insert(&to_persist).await {
            self.record_success(to_persist.len()).await;
        } else {
            self.retry_then_queue(to_persist).await;
        }
    }

    /// Runs `SqlStore::insert_batch` on the blocking thread pool, since
    /// rusqlite is synchronous. Returns `false` on any failure — a
    /// panicked task counts the same as a transaction error here.
    async fn try_insert(&self, events: &[ConsolidatedEvent]) -> bool {
        let store = self.store.clone();
        let batch = events.to_vec();
        matches!(
            tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await,
            Ok(Ok(()))
        )
    }

    async fn retry_then_queue(&self, events: Vec<ConsolidatedEvent>) {
        if self.try_insert(&events).await {
            self.record_success(events.len()).await;
            return;
        }

        error!(
            component = "persister",
            batch_size = events.len(),
            "transaction failed twice, writing batch to durable queue"
        );
        if let Err(e) = self.queue.append(&events) {
            error!(component = "persister", error = %e, "failed to append to durable queue — events lost");
        }
    }

    async fn record_success(&self, count: usize) {
        self.stats.total_persisted.fetch_add(count as u64, Ordering::Relaxed);
        self.stats.last_flush_at.store(Utc::now().timestamp(), Ordering::Relaxed);

        let fields = vec![
            ("batch_size".to_string(), count.to_string().into_bytes()),
            (
                "total_persisted".to_string(),
                self.stats.total_persisted.load(Ordering::Relaxed).to_string().into_bytes(),
            ),
            (
                "last_flush_at".to_string(),
                self.stats.last_flush_at.load(Ordering::Relaxed).to_string().into_bytes(),
            ),
            (
                "durable_queue_depth".to_string(),
                self.queue.depth().to_string().into_bytes(),
            ),
        ];
        if let Err(e) = self.broker.hset("stats:persister", fields, None).await {
            warn!(component = "persister", error = %e, "failed to update stats:persister");
        }
    }

    /// Background loop: periodically attempts to drain the durable
    /// queue even when no new consolidated events are arriving, so a
    /// store outage recovers without waiting for fresh traffic.
    pub async fn run_queue_drain(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.flush_interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if self.queue.depth() > 0 {
                        self.flush().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::types::{AlertLevel, Direction, ProcessingMetadata, RadarSample, WeatherSnapshot};

    fn event(id: &str) -> ConsolidatedEvent {
        ConsolidatedEvent {
            consolidation_id: id.to_string(),
            correlation_id: format!("corr-{id}"),
            trigger_source: "radar".to_string(),
            timestamp: Utc::now(),
            radar: RadarSample {
                correlation_id: format!("corr-{id}"),
                timestamp: Utc::now(),
                speed_native: 25.5,
                speed_mph: 25.5,
                magnitude: 25.5,
                direction: Direction::Approaching,
                alert_level: AlertLevel::Low,
            },
            camera: None,
            weather: WeatherSnapshot { local: None, remote: None },
            metadata: ProcessingMetadata {
                producer_version: "test".to_string(),
                data_sources: vec!["radar".to_string()],
            },
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> PersisterConfig {
        PersisterConfig {
            store_path: dir.path().join("store.db"),
            durable_queue_path: dir.path().join("queue.ndjson"),
            batch_size: 2,
            flush_interval_secs: 5,
            transaction_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn push_below_batch_size_does_not_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqlStore::open(&dir.path().join("store.db")).unwrap());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let persister = Persister::new(broker, store.clone(), test_config(&dir)).unwrap();

        persister.push(event("a")).await;

        let recent = store.recent(Utc::now() - chrono::Duration::hours(1), 10).unwrap();
        assert_eq!(recent.len(), 0);
    }

    #[tokio::test]
    async fn reaching_batch_size_flushes_and_updates_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqlStore::open(&dir.path().join("store.db")).unwrap());
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let persister = Persister::new(broker.clone(), store.clone(), test_config(&dir)).unwrap();

        persister.push(event("a")).await;
        persister.push(event("b")).await;

        let recent = store.recent(Utc::now() - chrono::Duration::hours(1), 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(persister.stats().total_persisted.load(Ordering::Relaxed), 2);
    }
}
