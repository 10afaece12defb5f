//! Default values and the environment-variable names that override them.
//! See spec §6 "Environment variables" for the canonical subset; names
//! here follow a single `TRAFFIC_` prefix.

pub const DEFAULT_STORE_PATH: &str = "/mnt/storage/data/traffic.db";
pub const DEFAULT_DURABLE_QUEUE_PATH: &str = "/mnt/storage/data/persister.queue";
pub const DEFAULT_LOG_DIR: &str = "/mnt/storage/logs";

pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_SERIAL_BAUD: u32 = 19200;
pub const DEFAULT_RADAR_READ_TIMEOUT_SECS: u64 = 2;

pub const DEFAULT_LOW_SPEED_THRESHOLD_MPH: f64 = 15.0;
pub const DEFAULT_HIGH_SPEED_THRESHOLD_MPH: f64 = 45.0;
pub const DEFAULT_MOTION_THRESHOLD_MPH: f64 = 2.0;

pub const DEFAULT_CAMERA_ROI: (f64, f64, f64, f64) = (0.0, 1.0, 0.0, 1.0);
pub const DEFAULT_CAMERA_LATEST_TTL_SECS: u64 = 10;

pub const DEFAULT_LOCAL_WEATHER_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_REMOTE_WEATHER_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_REMOTE_WEATHER_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WEATHER_TIMESERIES_WINDOW_SECS: i64 = 24 * 3600;

pub const DEFAULT_CAMERA_STALENESS_SECS: i64 = 2;
pub const DEFAULT_LOCAL_WEATHER_STALENESS_SECS: i64 = 15 * 60;
pub const DEFAULT_REMOTE_WEATHER_STALENESS_SECS: i64 = 60 * 60;
pub const DEFAULT_IDEMPOTENCY_WINDOW_SECS: i64 = 60;

pub const DEFAULT_PERSISTER_BATCH_SIZE: usize = 100;
pub const DEFAULT_PERSISTER_FLUSH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_STORE_TRANSACTION_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_BROADCASTER_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_BROADCASTER_BATCH_CAP: usize = 50;
pub const DEFAULT_BROADCASTER_LRU_CAPACITY: usize = 4096;

pub const DEFAULT_API_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_WS_HIGH_WATER_MARK: usize = 256;
pub const DEFAULT_WS_PING_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_IMAGE_MAX_AGE_HOURS: i64 = 24;
pub const DEFAULT_DISK_FREE_PCT_THRESHOLD: f64 = 10.0;
pub const DEFAULT_CAPTURE_DIR: &str = "/mnt/storage/captures";

pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 10;
pub const DEFAULT_BROKER_OP_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_BROKER_PUBLISH_RETRY_ATTEMPTS: u32 = 10;
