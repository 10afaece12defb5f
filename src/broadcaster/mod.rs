//! Broadcaster (§4.7): polls the store for rows persisted since the
//! last cursor position and republishes a compact summary for
//! real-time consumers (the WebSocket stream). Decoupled from the
//! Persister so a slow or disconnected API client never backpressures
//! ingestion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::{channels, Broker, BrokerJsonExt};
use crate::config::BroadcasterConfig;
use crate::persistence::SqlStore;
use crate::types::PersistedSummary;

/// Bounded FIFO membership set guarding against re-emitting an ID
/// already broadcast this process lifetime (§8: a Broadcaster restart
/// must not replay old IDs — the real guard is the rowid cursor below;
/// this catches the narrower case of the same row surfacing twice in
/// one polling pass).
struct SeenIds {
    order: VecDeque<i64>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        SeenIds {
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, id: i64) -> bool {
        if self.order.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            self.order.pop_front();
        }
        self.order.push_back(id);
        true
    }
}

pub struct Broadcaster {
    broker: Arc<dyn Broker>,
    store: Arc<SqlStore>,
    config: BroadcasterConfig,
    cursor: AtomicI64,
}

impl Broadcaster {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<SqlStore>, config: BroadcasterConfig) -> Self {
        Broadcaster {
            broker,
            store,
            config,
            cursor: AtomicI64::new(0),
        }
    }

    /// Restores the polling cursor, e.g. to the highest rowid already
    /// broadcast before a restart, so recovery never replays history.
    pub fn seed_cursor(&self, rowid: i64) {
        self.cursor.store(rowid, Ordering::Relaxed);
    }

    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut seen = SeenIds::new(self.config.lru_capacity);
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.poll_once(&mut seen).await;
                }
            }
        }
    }

    async fn poll_once(&self, seen: &mut SeenIds) {
        let cursor = self.cursor.load(Ordering::Relaxed);
        let rows = match self.store.rows_after(cursor, self.config.batch_cap as i64) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(component = "broadcaster", error = %e, "failed to poll store");
                return;
            }
        };

        if rows.is_empty() {
            return;
        }

        let mut max_rowid = cursor;
        for (rowid, row) in rows {
            max_rowid = max_rowid.max(rowid);
            if !seen.insert(rowid) {
                continue;
            }

            let timestamp = chrono::DateTime::from_timestamp(row.timestamp as i64, 0).unwrap_or_else(chrono::Utc::now);
            let summary = PersistedSummary {
                consolidation_id: row.id,
                timestamp,
                radar_speed_mph: row.speed_mph,
                primary_vehicle_type: row.primary_vehicle_type,
                alert_level: row.alert_level.unwrap_or_else(|| "normal".to_string()),
            };

            if let Err(e) = self.broker.publish_json(channels::PERSISTED, &summary).await {
                warn!(component = "broadcaster", error = %e, "failed to publish persisted summary");
            } else {
                debug!(component = "broadcaster", consolidation_id = %summary.consolidation_id, "broadcast persisted row");
            }
        }

        self.cursor.store(max_rowid, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::persistence::SqlStore;
    use crate::types::{AlertLevel, ConsolidatedEvent, Direction, ProcessingMetadata, RadarSample, WeatherSnapshot};

    fn event(id: &str) -> ConsolidatedEvent {
        ConsolidatedEvent {
            consolidation_id: id.to_string(),
            correlation_id: format!("corr-{id}"),
            trigger_source: "radar".to_string(),
            timestamp: chrono::Utc::now(),
            radar: RadarSample {
                correlation_id: format!("corr-{id}"),
                timestamp: chrono::Utc::now(),
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

    fn test_config() -> BroadcasterConfig {
        BroadcasterConfig {
            poll_interval_secs: 1,
            batch_cap: 50,
            lru_capacity: 128,
        }
    }

    #[tokio::test]
    async fn polling_publishes_new_rows_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqlStore::open(&dir.path().join("test.db")).unwrap());
        store.insert_batch(&[event("a"), event("b")]).unwrap();

        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let broadcaster = Broadcaster::new(broker.clone(), store.clone(), test_config());
        let mut rx = broker.subscribe(channels::PERSISTED);
        let mut seen = SeenIds::new(128);

        broadcaster.poll_once(&mut seen).await;

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
        let _: PersistedSummary = serde_json::from_slice(&first).unwrap();
        let _: PersistedSummary = serde_json::from_slice(&second).unwrap();

        broadcaster.poll_once(&mut seen).await;
        assert!(rx.try_recv().is_err(), "no new rows should have been emitted twice");
    }

    #[tokio::test]
    async fn restart_with_seeded_cursor_does_not_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqlStore::open(&dir.path().join("test.db")).unwrap());
        store.insert_batch(&[event("a")]).unwrap();

        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let broadcaster = Broadcaster::new(broker.clone(), store.clone(), test_config());
        broadcaster.seed_cursor(1_000_000);

        let mut rx = broker.subscribe(channels::PERSISTED);
        let mut seen = SeenIds::new(128);
        broadcaster.poll_once(&mut seen).await;

        assert!(rx.try_recv().is_err());
    }
}
