//! Closed, tagged record types carried over the broker's channels and
//! through the rest of the pipeline. One type per channel payload in
//! §4.1, plus the entities composed from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `alert_level` thresholds, mph. Defaults from §3; configurable via
/// [`crate::config::AppConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Normal,
    Low,
    High,
}

impl AlertLevel {
    /// Pure function of `|speed|` and the two configured thresholds.
    /// Equal inputs always produce an equal result (§8 invariant 4).
    pub fn classify(abs_speed_mph: f64, low_threshold: f64, high_threshold: f64) -> Self {
        if abs_speed_mph >= high_threshold {
            AlertLevel::High
        } else if abs_speed_mph >= low_threshold {
            AlertLevel::Low
        } else {
            AlertLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Low => "low",
            AlertLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Approaching,
    Receding,
    Stationary,
}

impl Direction {
    pub fn from_signed_speed(signed: f64) -> Self {
        if signed > 0.0 {
            Direction::Approaching
        } else if signed < 0.0 {
            Direction::Receding
        } else {
            Direction::Stationary
        }
    }
}

/// Published on `traffic:radar`. Ephemeral unless promoted by the
/// Consolidator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadarSample {
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub speed_native: f64,
    pub speed_mph: f64,
    pub magnitude: f64,
    pub direction: Direction,
    pub alert_level: AlertLevel,
}

/// Closed taxonomy from §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Truck,
    Motorcycle,
    Bus,
    Unknown,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Car => "car",
            VehicleType::Truck => "truck",
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Bus => "bus",
            VehicleType::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "car" => VehicleType::Car,
            "truck" => VehicleType::Truck,
            "motorcycle" => VehicleType::Motorcycle,
            "bus" => VehicleType::Bus,
            _ => VehicleType::Unknown,
        }
    }
}

/// Pixel-space bounding box, `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// Published on `traffic:camera`. Held as "latest" with a short validity
/// window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraClassification {
    pub timestamp: DateTime<Utc>,
    pub vehicle_count: u32,
    pub primary_vehicle_type: VehicleType,
    pub detection_confidence: f64,
    pub bounding_boxes: Vec<BoundingBox>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalWeatherReading {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub temperature_f: f64,
    pub humidity_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteWeatherReading {
    pub timestamp: DateTime<Utc>,
    pub text_description: Option<String>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_speed: Option<f64>,
    pub visibility: Option<f64>,
    pub station_id: Option<String>,
}

/// Processing metadata embedded in a [`ConsolidatedEvent`]: which
/// sources actually contributed, and the producer version that made the
/// decision (for forward-compatible replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub producer_version: String,
    pub data_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub local: Option<LocalWeatherReading>,
    pub remote: Option<RemoteWeatherReading>,
}

/// Published on `traffic:consolidated`, written to `consolidation:latest`
/// and `consolidation:history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedEvent {
    pub consolidation_id: String,
    pub correlation_id: String,
    pub trigger_source: String,
    pub timestamp: DateTime<Utc>,
    pub radar: RadarSample,
    pub camera: Option<CameraClassification>,
    pub weather: WeatherSnapshot,
    pub metadata: ProcessingMetadata,
}

/// Compact summary published on `traffic:persisted` by the Broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSummary {
    pub consolidation_id: String,
    pub timestamp: DateTime<Utc>,
    pub radar_speed_mph: Option<f64>,
    pub primary_vehicle_type: Option<String>,
    pub alert_level: String,
}

/// Published on `traffic:alert` by RadarReader or Maintenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_level_boundaries_are_inclusive() {
        assert_eq!(AlertLevel::classify(15.0, 15.0, 45.0), AlertLevel::Low);
        assert_eq!(AlertLevel::classify(45.0, 15.0, 45.0), AlertLevel::High);
        assert_eq!(AlertLevel::classify(14.999, 15.0, 45.0), AlertLevel::Normal);
    }

    #[test]
    fn equal_speeds_produce_equal_levels() {
        let a = AlertLevel::classify(30.0, 15.0, 45.0);
        let b = AlertLevel::classify(30.0, 15.0, 45.0);
        assert_eq!(a, b);
    }

    #[test]
    fn direction_from_sign() {
        assert_eq!(Direction::from_signed_speed(5.0), Direction::Approaching);
        assert_eq!(Direction::from_signed_speed(-5.0), Direction::Receding);
        assert_eq!(Direction::from_signed_speed(0.0), Direction::Stationary);
    }
}
