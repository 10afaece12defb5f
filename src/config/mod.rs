//! Process-wide configuration.
//!
//! Loaded once at startup from environment variables (with built-in
//! defaults), then published through a `OnceLock` so every component
//! can read it without threading a reference through every constructor.
//! Calling [`get`] before [`init`] is a programming error and panics —
//! by design, the same contract the acquisition layer's global config
//! uses, since no component should run before configuration exists.

pub mod defaults;

use std::env;
use std::sync::OnceLock;

use crate::types::VehicleType;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct RadarConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout_secs: u64,
    pub low_speed_threshold_mph: f64,
    pub high_speed_threshold_mph: f64,
    pub motion_threshold_mph: f64,
    pub startup_commands: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Roi {
    pub x_start: f64,
    pub x_end: f64,
    pub y_start: f64,
    pub y_end: f64,
}

impl Roi {
    pub fn contains(&self, x_frac: f64, y_frac: f64) -> bool {
        x_frac >= self.x_start && x_frac <= self.x_end && y_frac >= self.y_start && y_frac <= self.y_end
    }
}

#[derive(Debug, Clone)]
pub enum CameraSourceConfig {
    Broker,
    FileDrop { directory: std::path::PathBuf },
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub source: CameraSourceConfig,
    pub roi: Roi,
    pub class_whitelist: Vec<VehicleType>,
    pub latest_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub local_poll_interval_secs: u64,
    pub remote_poll_interval_secs: u64,
    pub remote_url: String,
    pub remote_timeout_secs: u64,
    pub timeseries_window_secs: i64,
}

#[derive(Debug, Clone)]
pub struct ConsolidatorConfig {
    pub idempotency_window_secs: i64,
    pub camera_staleness_secs: i64,
    pub local_weather_staleness_secs: i64,
    pub remote_weather_staleness_secs: i64,
}

#[derive(Debug, Clone)]
pub struct PersisterConfig {
    pub store_path: std::path::PathBuf,
    pub durable_queue_path: std::path::PathBuf,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub transaction_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub poll_interval_secs: u64,
    pub batch_cap: usize,
    pub lru_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub ws_high_water_mark: usize,
    pub ws_ping_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub capture_dir: std::path::PathBuf,
    pub image_max_age_hours: i64,
    pub disk_free_pct_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub radar: RadarConfig,
    pub camera: CameraConfig,
    pub weather: WeatherConfig,
    pub consolidator: ConsolidatorConfig,
    pub persister: PersisterConfig,
    pub broadcaster: BroadcasterConfig,
    pub api: ApiConfig,
    pub maintenance: MaintenanceConfig,
    pub shutdown_deadline_secs: u64,
    pub broker_op_timeout_secs: u64,
    pub log_level: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl AppConfig {
    /// Build configuration from environment variables, falling back to
    /// the defaults in [`defaults`]. Never panics; invalid values are
    /// simply replaced by defaults rather than rejected here — schema
    /// validation that can fail the process happens once, in `main`,
    /// so the fatal-vs-degraded distinction is made in exactly one
    /// place.
    pub fn from_env() -> Self {
        use defaults::*;

        let camera_source = match env::var("TRAFFIC_CAMERA_SOURCE").as_deref() {
            Ok("file_drop") => CameraSourceConfig::FileDrop {
                directory: env_or_string("TRAFFIC_CAMERA_DROP_DIR", "/mnt/storage/camera_drop").into(),
            },
            _ => CameraSourceConfig::Broker,
        };

        let roi = Roi {
            x_start: env_or("TRAFFIC_CAMERA_ROI_X_START", DEFAULT_CAMERA_ROI.0),
            x_end: env_or("TRAFFIC_CAMERA_ROI_X_END", DEFAULT_CAMERA_ROI.1),
            y_start: env_or("TRAFFIC_CAMERA_ROI_Y_START", DEFAULT_CAMERA_ROI.2),
            y_end: env_or("TRAFFIC_CAMERA_ROI_Y_END", DEFAULT_CAMERA_ROI.3),
        };

        let class_whitelist = env_list("TRAFFIC_CAMERA_CLASSES", &["car", "truck", "motorcycle", "bus"])
            .iter()
            .map(|s| VehicleType::from_label(s))
            .collect();

        AppConfig {
            radar: RadarConfig {
                port: env_or_string("TRAFFIC_RADAR_PORT", DEFAULT_SERIAL_PORT),
                baud: env_or("TRAFFIC_RADAR_BAUD", DEFAULT_SERIAL_BAUD),
                read_timeout_secs: env_or("TRAFFIC_RADAR_READ_TIMEOUT_SECS", DEFAULT_RADAR_READ_TIMEOUT_SECS),
                low_speed_threshold_mph: env_or(
                    "TRAFFIC_RADAR_LOW_THRESHOLD_MPH",
                    DEFAULT_LOW_SPEED_THRESHOLD_MPH,
                ),
                high_speed_threshold_mph: env_or(
                    "TRAFFIC_RADAR_HIGH_THRESHOLD_MPH",
                    DEFAULT_HIGH_SPEED_THRESHOLD_MPH,
                ),
                motion_threshold_mph: env_or(
                    "TRAFFIC_RADAR_MOTION_THRESHOLD_MPH",
                    DEFAULT_MOTION_THRESHOLD_MPH,
                ),
                startup_commands: env_list(
                    "TRAFFIC_RADAR_STARTUP_COMMANDS",
                    &["OJ", "UM", "M>45\\", "M<15\\", "OA"],
                ),
            },
            camera: CameraConfig {
                source: camera_source,
                roi,
                class_whitelist,
                latest_ttl_secs: env_or("TRAFFIC_CAMERA_LATEST_TTL_SECS", DEFAULT_CAMERA_LATEST_TTL_SECS),
            },
            weather: WeatherConfig {
                local_poll_interval_secs: env_or(
                    "TRAFFIC_LOCAL_WEATHER_INTERVAL_SECS",
                    DEFAULT_LOCAL_WEATHER_INTERVAL_SECS,
                ),
                remote_poll_interval_secs: env_or(
                    "TRAFFIC_REMOTE_WEATHER_INTERVAL_SECS",
                    DEFAULT_REMOTE_WEATHER_INTERVAL_SECS,
                ),
                remote_url: env_or_string(
                    "TRAFFIC_REMOTE_WEATHER_URL",
                    "https://api.weather.gov/stations/KPHX/observations/latest",
                ),
                remote_timeout_secs: env_or(
                    "TRAFFIC_REMOTE_WEATHER_TIMEOUT_SECS",
                    DEFAULT_REMOTE_WEATHER_TIMEOUT_SECS,
                ),
                timeseries_window_secs: env_or(
                    "TRAFFIC_WEATHER_TIMESERIES_WINDOW_SECS",
                    DEFAULT_WEATHER_TIMESERIES_WINDOW_SECS,
                ),
            },
            consolidator: ConsolidatorConfig {
                idempotency_window_secs: env_or(
                    "TRAFFIC_IDEMPOTENCY_WINDOW_SECS",
                    DEFAULT_IDEMPOTENCY_WINDOW_SECS,
                ),
                camera_staleness_secs: env_or(
                    "TRAFFIC_CAMERA_STALENESS_SECS",
                    DEFAULT_CAMERA_STALENESS_SECS,
                ),
                local_weather_staleness_secs: env_or(
                    "TRAFFIC_LOCAL_WEATHER_STALENESS_SECS",
                    DEFAULT_LOCAL_WEATHER_STALENESS_SECS,
                ),
                remote_weather_staleness_secs: env_or(
                    "TRAFFIC_REMOTE_WEATHER_STALENESS_SECS",
                    DEFAULT_REMOTE_WEATHER_STALENESS_SECS,
                ),
            },
            persister: PersisterConfig {
                store_path: env_or_string("TRAFFIC_STORE_PATH", DEFAULT_STORE_PATH).into(),
                durable_queue_path: env_or_string(
                    "TRAFFIC_DURABLE_QUEUE_PATH",
                    DEFAULT_DURABLE_QUEUE_PATH,
                )
                .into(),
                batch_size: env_or("TRAFFIC_PERSISTER_BATCH_SIZE", DEFAULT_PERSISTER_BATCH_SIZE),
                flush_interval_secs: env_or(
                    "TRAFFIC_PERSISTER_FLUSH_INTERVAL_SECS",
                    DEFAULT_PERSISTER_FLUSH_INTERVAL_SECS,
                ),
                transaction_timeout_secs: env_or(
                    "TRAFFIC_STORE_TRANSACTION_TIMEOUT_SECS",
                    DEFAULT_STORE_TRANSACTION_TIMEOUT_SECS,
                ),
            },
            broadcaster: BroadcasterConfig {
                poll_interval_secs: env_or(
                    "TRAFFIC_BROADCASTER_POLL_INTERVAL_SECS",
                    DEFAULT_BROADCASTER_POLL_INTERVAL_SECS,
                ),
                batch_cap: env_or("TRAFFIC_BROADCASTER_BATCH_CAP", DEFAULT_BROADCASTER_BATCH_CAP),
                lru_capacity: env_or(
                    "TRAFFIC_BROADCASTER_LRU_CAPACITY",
                    DEFAULT_BROADCASTER_LRU_CAPACITY,
                ),
            },
            api: ApiConfig {
                bind_addr: env_or_string("TRAFFIC_API_BIND_ADDR", DEFAULT_API_BIND_ADDR),
                port: env_or("TRAFFIC_API_PORT", DEFAULT_API_PORT),
                allowed_origins: env_list("TRAFFIC_API_ALLOWED_ORIGINS", &["http://localhost:3000"]),
                ws_high_water_mark: env_or("TRAFFIC_WS_HIGH_WATER_MARK", DEFAULT_WS_HIGH_WATER_MARK),
                ws_ping_interval_secs: env_or(
                    "TRAFFIC_WS_PING_INTERVAL_SECS",
                    DEFAULT_WS_PING_INTERVAL_SECS,
                ),
            },
            maintenance: MaintenanceConfig {
                capture_dir: env_or_string("TRAFFIC_CAPTURE_DIR", DEFAULT_CAPTURE_DIR).into(),
                image_max_age_hours: env_or(
                    "TRAFFIC_IMAGE_MAX_AGE_HOURS",
                    DEFAULT_IMAGE_MAX_AGE_HOURS,
                ),
                disk_free_pct_threshold: env_or(
                    "TRAFFIC_DISK_FREE_PCT_THRESHOLD",
                    DEFAULT_DISK_FREE_PCT_THRESHOLD,
                ),
            },
            shutdown_deadline_secs: env_or(
                "TRAFFIC_SHUTDOWN_DEADLINE_SECS",
                DEFAULT_SHUTDOWN_DEADLINE_SECS,
            ),
            broker_op_timeout_secs: env_or(
                "TRAFFIC_BROKER_OP_TIMEOUT_SECS",
                DEFAULT_BROKER_OP_TIMEOUT_SECS,
            ),
            log_level: env_or_string("TRAFFIC_LOG_LEVEL", "info"),
        }
    }
}

/// Publish `config` as the process-wide configuration. Returns an error
/// if called more than once.
pub fn init(config: AppConfig) -> Result<(), AppConfig> {
    CONFIG.set(config)
}

/// Retrieve the process-wide configuration.
///
/// # Panics
/// Panics if [`init`] has not yet been called. Every component runs
/// after `main` initializes configuration, so this should never fire
/// outside of a test that forgot to call `init`.
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("config::init must run before config::get")
}

pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_contains_checks_fractional_rectangle() {
        let roi = Roi {
            x_start: 0.2,
            x_end: 0.8,
            y_start: 0.1,
            y_end: 0.9,
        };
        assert!(roi.contains(0.5, 0.5));
        assert!(!roi.contains(0.1, 0.5));
        assert!(!roi.contains(0.5, 0.95));
    }
}
