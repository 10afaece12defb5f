//! Durable queue: an append-only file holding consolidated events the
//! Persister could not commit to the store, per §4.6's failure
//! semantics. A background task drains it on connectivity recovery.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::ConsolidatedEvent;

pub struct DurableQueue {
    path: PathBuf,
    depth: AtomicUsize,
}

impl DurableQueue {
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let depth = if path.exists() {
            std::fs::read_to_string(&path)?
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count()
        } else {
            OpenOptions::new().create(true).write(true).open(&path)?;
            0
        };
        Ok(DurableQueue {
            path,
            depth: AtomicUsize::new(depth),
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn append(&self, events: &[ConsolidatedEvent]) -> std::io::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for event in events {
            let line = serde_json::to_string(event)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{line}")?;
        }
        self.depth.fetch_add(events.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Removes and returns every queued event. Callers that fail to
    /// persist some of the returned events are responsible for
    /// re-appending them.
    pub fn drain_all(&self) -> std::io::Result<Vec<ConsolidatedEvent>> {
        let contents = std::fs::read_to_string(&self.path).unwrap_or_default();
        let events: Vec<ConsolidatedEvent> = contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?;
        self.depth.store(0, Ordering::Relaxed);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertLevel, Direction, RadarSample};

    fn sample_event() -> ConsolidatedEvent {
        ConsolidatedEvent {
            consolidation_id: "c1".to_string(),
            correlation_id: "r1".to_string(),
            trigger_source: "radar".to_string(),
            timestamp: chrono::Utc::now(),
            radar: RadarSample {
                correlation_id: "r1".to_string(),
                timestamp: chrono::Utc::now(),
                speed_native: 30.0,
                speed_mph: 30.0,
                magnitude: 30.0,
                direction: Direction::Approaching,
                alert_level: AlertLevel::Low,
            },
            camera: None,
            weather: crate::types::WeatherSnapshot {
                local: None,
                remote: None,
            },
            metadata: crate::types::ProcessingMetadata {
                producer_version: "test".to_string(),
                data_sources: vec!["radar".to_string()],
            },
        }
    }

    #[test]
    fn append_and_drain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.ndjson");
        let queue = DurableQueue::open(path).unwrap();

        queue.append(&[sample_event(), sample_event()]).unwrap();
        assert_eq!(queue.depth(), 2);

        let drained = queue.drain_all().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn depth_recovered_from_existing_file_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.ndjson");
        {
            let queue = DurableQueue::open(path.clone()).unwrap();
            queue.append(&[sample_event()]).unwrap();
        }
        let reopened = DurableQueue::open(path).unwrap();
        assert_eq!(reopened.depth(), 1);
    }
}
