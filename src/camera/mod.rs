//! CameraReader (§4.3): filters external AI detections by region of
//! interest and vehicle class, publishes a classification summary, and
//! holds a rolling "latest classification" snapshot.

pub mod source;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{channels, Broker, BrokerJsonExt};
use crate::config::{CameraConfig, Roi};
use crate::types::{BoundingBox, CameraClassification, VehicleType};

use source::{CameraSource, RawDetection, RawDetectionBatch};

pub struct CameraReader {
    broker: Arc<dyn Broker>,
    config: CameraConfig,
}

impl CameraReader {
    pub fn new(broker: Arc<dyn Broker>, config: CameraConfig) -> Self {
        CameraReader { broker, config }
    }

    pub async fn run(&self, mut source: Box<dyn CameraSource>, cancel: CancellationToken) {
        loop {
            let Some(batch) = source.next_batch(&cancel).await else {
                debug!(component = "camera_reader", "shutting down");
                return;
            };
            self.handle_batch(batch).await;
        }
    }

    fn center_fraction(bbox: &[f64; 4], frame_width: f64, frame_height: f64) -> (f64, f64) {
        let cx = (bbox[0] + bbox[2]) / 2.0;
        let cy = (bbox[1] + bbox[3]) / 2.0;
        if frame_width <= 0.0 || frame_height <= 0.0 {
            return (0.0, 0.0);
        }
        (cx / frame_width, cy / frame_height)
    }

    fn roi_and_class_filter<'a>(&self, batch: &'a RawDetectionBatch) -> Vec<&'a RawDetection> {
        batch
            .detections
            .iter()
            .filter(|d| {
                let (fx, fy) = Self::center_fraction(&d.bbox, batch.frame_width, batch.frame_height);
                self.roi().contains(fx, fy)
            })
            .filter(|d| {
                let class = VehicleType::from_label(&d.class);
                self.config.class_whitelist.contains(&class)
            })
            .collect()
    }

    fn roi(&self) -> Roi {
        self.config.roi
    }

    async fn handle_batch(&self, batch: RawDetectionBatch) {
        let survivors = self.roi_and_class_filter(&batch);

        let vehicle_count = survivors.len() as u32;
        let primary_vehicle_type = survivors
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
            .map(|d| VehicleType::from_label(&d.class))
            .unwrap_or(VehicleType::Unknown);
        let detection_confidence = survivors
            .iter()
            .map(|d| d.confidence)
            .fold(0.0_f64, f64::max);
        let bounding_boxes = survivors
            .iter()
            .map(|d| BoundingBox {
                x1: d.bbox[0],
                y1: d.bbox[1],
                x2: d.bbox[2],
                y2: d.bbox[3],
            })
            .collect();

        let classification = CameraClassification {
            timestamp: batch.timestamp,
            vehicle_count,
            primary_vehicle_type,
            detection_confidence,
            bounding_boxes,
        };

        let ttl = Duration::from_secs(self.config.latest_ttl_secs);
        if let Err(e) = self
            .broker
            .set_json("camera:latest", &classification, Some(ttl))
            .await
        {
            warn!(component = "camera_reader", error = %e, "failed to update camera:latest");
        }

        if let Err(e) = self
            .broker
            .publish_json(channels::CAMERA, &classification)
            .await
        {
            warn!(component = "camera_reader", error = %e, "failed to publish camera classification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::CameraSourceConfig;

    fn test_config() -> CameraConfig {
        CameraConfig {
            source: CameraSourceConfig::Broker,
            roi: Roi {
                x_start: 0.2,
                x_end: 0.8,
                y_start: 0.0,
                y_end: 1.0,
            },
            class_whitelist: vec![VehicleType::Car, VehicleType::Truck],
            latest_ttl_secs: 10,
        }
    }

    fn batch(detections: Vec<RawDetection>) -> RawDetectionBatch {
        RawDetectionBatch {
            timestamp: chrono::Utc::now(),
            detections,
            frame_width: 1000.0,
            frame_height: 1000.0,
        }
    }

    #[tokio::test]
    async fn filters_outside_roi_and_non_whitelisted_class() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let reader = CameraReader::new(broker.clone(), test_config());

        let b = batch(vec![
            RawDetection {
                class: "car".to_string(),
                confidence: 0.9,
                bbox: [500.0, 500.0, 520.0, 520.0], // inside ROI
            },
            RawDetection {
                class: "car".to_string(),
                confidence: 0.9,
                bbox: [10.0, 10.0, 20.0, 20.0], // outside ROI
            },
            RawDetection {
                class: "pedestrian".to_string(),
                confidence: 0.95,
                bbox: [500.0, 500.0, 520.0, 520.0], // not whitelisted
            },
        ]);

        reader.handle_batch(b).await;

        let classification: CameraClassification =
            broker.get_json("camera:latest").await.unwrap().unwrap();
        assert_eq!(classification.vehicle_count, 1);
    }

    #[tokio::test]
    async fn empty_survivor_list_yields_unknown_primary_type() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let reader = CameraReader::new(broker.clone(), test_config());

        reader.handle_batch(batch(vec![])).await;

        let classification: CameraClassification =
            broker.get_json("camera:latest").await.unwrap().unwrap();
        assert_eq!(classification.vehicle_count, 0);
        assert_eq!(classification.primary_vehicle_type, VehicleType::Unknown);
    }
}
