//! Consolidator (§4.5): radar-triggered correlator. For each motion
//! event, gathers the latest camera and weather snapshots within a
//! bounded time window and emits one consolidated event.
//!
//! Events are handled independently and in parallel — snapshots are
//! read-only at this stage, so a slow assembly for one event never
//! blocks another (§4.5 "Ordering").

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{channels, Broker, BrokerJsonExt};
use crate::config::ConsolidatorConfig;
use crate::types::{
    CameraClassification, ConsolidatedEvent, LocalWeatherReading, ProcessingMetadata, RadarSample,
    RemoteWeatherReading, WeatherSnapshot,
};

const IDEMPOTENCY_KEY_TTL_PAD_SECS: u64 = 1;
const CONSOLIDATION_LATEST_TTL: Duration = Duration::from_secs(60 * 60);
const CONSOLIDATION_HISTORY_TTL: Duration = Duration::from_secs(48 * 60 * 60);
const PRODUCER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Consolidator {
    broker: Arc<dyn Broker>,
    config: ConsolidatorConfig,
}

impl Consolidator {
    pub fn new(broker: Arc<dyn Broker>, config: ConsolidatorConfig) -> Self {
        Consolidator { broker, config }
    }

    /// Drives the subscription loop until the broker channel closes or
    /// cancellation is observed by the caller dropping this future.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut rx = self.broker.subscribe(channels::RADAR);
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                msg = rx.recv() => msg,
            };

            let bytes = match received {
                Ok(bytes) => bytes,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(component = "consolidator", skipped = n, "radar feed lagged, skipping");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            let sample: RadarSample = match serde_json::from_slice(&bytes) {
                Ok(s) => s,
                Err(e) => {
                    warn!(component = "consolidator", error = %e, "malformed radar sample, skipping");
                    continue;
                }
            };

            let this = self.clone();
            tokio::spawn(async move { this.handle_sample(sample).await });
        }
    }

    async fn handle_sample(&self, sample: RadarSample) {
        if self.already_consolidated(&sample.correlation_id).await {
            debug!(
                component = "consolidator",
                correlation_id = %sample.correlation_id,
                "duplicate within idempotency window, dropping"
            );
            return;
        }

        let camera = self.fresh_camera_snapshot(&sample).await;
        let local_weather = self.fresh_local_weather(&sample).await;
        let remote_weather = self.fresh_remote_weather(&sample).await;

        let mut data_sources = vec!["radar".to_string()];
        if camera.is_some() {
            data_sources.push("camera".to_string());
        }
        if local_weather.is_some() || remote_weather.is_some() {
            data_sources.push("weather".to_string());
        }

        let event = ConsolidatedEvent {
            consolidation_id: Uuid::new_v4().to_string(),
            correlation_id: sample.correlation_id.clone(),
            trigger_source: "radar".to_string(),
            timestamp: sample.timestamp,
            radar: sample,
            camera,
            weather: WeatherSnapshot {
                local: local_weather,
                remote: remote_weather,
            },
            metadata: ProcessingMetadata {
                producer_version: PRODUCER_VERSION.to_string(),
                data_sources,
            },
        };

        self.emit(event).await;
    }

    async fn already_consolidated(&self, correlation_id: &str) -> bool {
        let key = format!("consolidation:seen:{correlation_id}");
        match self.broker.get(&key).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                let ttl = Duration::from_secs(
                    self.config.idempotency_window_secs as u64 + IDEMPOTENCY_KEY_TTL_PAD_SECS,
                );
                let _ = self.broker.set(&key, b"1".to_vec(), Some(ttl)).await;
                false
            }
            Err(_) => false,
        }
    }

    async fn fresh_camera_snapshot(&self, sample: &RadarSample) -> Option<CameraClassification> {
        let snapshot: CameraClassification = self
            .broker
            .get_json("camera:latest")
            .await
            .ok()
            .flatten()?;
        let age = (sample.timestamp - snapshot.timestamp).num_seconds().abs();
        (age <= self.config.camera_staleness_secs).then_some(snapshot)
    }

    async fn fresh_local_weather(&self, sample: &RadarSample) -> Option<LocalWeatherReading> {
        let snapshot: LocalWeatherReading = self
            .broker
            .get_json("weather:dht22:latest")
            .await
            .ok()
            .flatten()?;
        let age = (sample.timestamp - snapshot.timestamp).num_seconds().abs();
        (age <= self.config.local_weather_staleness_secs).then_some(snapshot)
    }

    async fn fresh_remote_weather(&self, sample: &RadarSample) -> Option<RemoteWeatherReading> {
        let snapshot: RemoteWeatherReading = self
            .broker
            .get_json("weather:airport:latest")
            .await
            .ok()
            .flatten()?;
        let age = (sample.timestamp - snapshot.timestamp).num_seconds().abs();
        (age <= self.config.remote_weather_staleness_secs).then_some(snapshot)
    }

    async fn emit(&self, event: ConsolidatedEvent) {
        if let Err(e) = self.broker.publish_json(channels::CONSOLIDATED, &event).await {
            warn!(component = "consolidator", error = %e, "failed to publish consolidated event");
        }
        if let Err(e) = self
            .broker
            .set_json("consolidation:latest", &event, Some(CONSOLIDATION_LATEST_TTL))
            .await
        {
            warn!(component = "consolidator", error = %e, "failed to update consolidation:latest");
        }
        let score = Utc::now().timestamp() as f64;
        if let Ok(member) = serde_json::to_vec(&event) {
            if let Err(e) = self
                .broker
                .zadd("consolidation:history", score, member, Some(CONSOLIDATION_HISTORY_TTL))
                .await
            {
                warn!(component = "consolidator", error = %e, "failed to append consolidation history");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::types::{AlertLevel, Direction};

    fn test_config() -> ConsolidatorConfig {
        ConsolidatorConfig {
            idempotency_window_secs: 60,
            camera_staleness_secs: 2,
            local_weather_staleness_secs: 15 * 60,
            remote_weather_staleness_secs: 60 * 60,
        }
    }

    fn sample() -> RadarSample {
        RadarSample {
            correlation_id: "abc12345".to_string(),
            timestamp: Utc::now(),
            speed_native: 25.5,
            speed_mph: 25.5,
            magnitude: 25.5,
            direction: Direction::Approaching,
            alert_level: AlertLevel::Low,
        }
    }

    #[tokio::test]
    async fn emits_consolidated_event_with_fresh_camera_and_weather() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let consolidator = Consolidator::new(broker.clone(), test_config());

        let classification = CameraClassification {
            timestamp: Utc::now(),
            vehicle_count: 1,
            primary_vehicle_type: crate::types::VehicleType::Car,
            detection_confidence: 0.91,
            bounding_boxes: vec![],
        };
        broker.set_json("camera:latest", &classification, None).await.unwrap();

        let mut rx = broker.subscribe(channels::CONSOLIDATED);
        consolidator.handle_sample(sample()).await;

        let payload = rx.try_recv().expect("expected a consolidated event");
        let event: ConsolidatedEvent = serde_json::from_slice(&payload).unwrap();
        assert!(event.camera.is_some());
        assert_eq!(event.metadata.data_sources, vec!["radar", "camera"]);
    }

    #[tokio::test]
    async fn duplicate_within_idempotency_window_is_dropped() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let consolidator = Consolidator::new(broker.clone(), test_config());

        let mut rx = broker.subscribe(channels::CONSOLIDATED);
        consolidator.handle_sample(sample()).await;
        rx.try_recv().expect("first event should publish");

        consolidator.handle_sample(sample()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_camera_is_excluded() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let consolidator = Consolidator::new(broker.clone(), test_config());

        let stale = CameraClassification {
            timestamp: Utc::now() - chrono::Duration::seconds(30),
            vehicle_count: 1,
            primary_vehicle_type: crate::types::VehicleType::Car,
            detection_confidence: 0.8,
            bounding_boxes: vec![],
        };
        broker.set_json("camera:latest", &stale, None).await.unwrap();

        let mut rx = broker.subscribe(channels::CONSOLIDATED);
        consolidator.handle_sample(sample()).await;

        let payload = rx.try_recv().expect("expected a consolidated event");
        let event: ConsolidatedEvent = serde_json::from_slice(&payload).unwrap();
        assert!(event.camera.is_none());
        assert_eq!(event.metadata.data_sources, vec!["radar"]);
    }
}
