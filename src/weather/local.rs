//! LocalWeatherReader: samples a one-wire temperature/humidity sensor
//! on a fixed interval. The sensor itself is a capability injected at
//! construction (a typed [`LocalSensor`] handle, not a global), so
//! tests exercise the reader against a fake without touching hardware.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker::{Broker, BrokerJsonExt};
use crate::error::{Classify, ErrorKind};
use crate::types::LocalWeatherReading;

#[derive(Debug, Error)]
pub enum LocalSensorError {
    #[error("sensor read failed: {0}")]
    ReadFailed(String),
}

impl Classify for LocalSensorError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Degraded
    }
}

/// Capability handle for the on-board one-wire sensor. A production
/// implementation wraps whatever sysfs/GPIO path the board exposes; a
/// test implementation returns canned readings.
pub trait LocalSensor: Send + Sync {
    /// Returns `(temperature_celsius, humidity_pct)`.
    fn read(&self) -> Result<(f64, f64), LocalSensorError>;
}

/// Reads a two-line sysfs-style text file (`temperature_c\nhumidity_pct\n`)
/// exposed by the board's one-wire sensor driver.
pub struct SysfsLocalSensor {
    path: std::path::PathBuf,
}

impl SysfsLocalSensor {
    pub fn new(path: std::path::PathBuf) -> Self {
        SysfsLocalSensor { path }
    }
}

impl LocalSensor for SysfsLocalSensor {
    fn read(&self) -> Result<(f64, f64), LocalSensorError> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| LocalSensorError::ReadFailed(e.to_string()))?;
        let mut lines = contents.lines();
        let temp_c: f64 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| LocalSensorError::ReadFailed("missing temperature line".to_string()))?;
        let humidity: f64 = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| LocalSensorError::ReadFailed("missing humidity line".to_string()))?;
        Ok((temp_c, humidity))
    }
}

const LOCAL_LATEST_TTL: Duration = Duration::from_secs(30 * 60);

pub struct LocalWeatherReader {
    broker: Arc<dyn Broker>,
    sensor: Arc<dyn LocalSensor>,
    poll_interval: Duration,
}

impl LocalWeatherReader {
    pub fn new(broker: Arc<dyn Broker>, sensor: Arc<dyn LocalSensor>, poll_interval: Duration) -> Self {
        LocalWeatherReader {
            broker,
            sensor,
            poll_interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => self.poll_once().await,
            }
        }
    }

    pub async fn poll_once(&self) {
        match self.sensor.read() {
            Ok((temp_c, humidity_pct)) => {
                let reading = LocalWeatherReading {
                    timestamp: chrono::Utc::now(),
                    temperature_c: temp_c,
                    temperature_f: celsius_to_fahrenheit(temp_c),
                    humidity_pct,
                };
                if let Err(e) = self
                    .broker
                    .set_json("weather:dht22:latest", &reading, Some(LOCAL_LATEST_TTL))
                    .await
                {
                    warn!(component = "local_weather_reader", error = %e, "failed to update weather:dht22:latest");
                }
            }
            Err(e) => {
                warn!(component = "local_weather_reader", error = %e, "sensor read failed, keeping previous reading");
            }
        }
    }
}

pub fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    struct FixedSensor(f64, f64);
    impl LocalSensor for FixedSensor {
        fn read(&self) -> Result<(f64, f64), LocalSensorError> {
            Ok((self.0, self.1))
        }
    }

    #[tokio::test]
    async fn poll_writes_both_unit_representations() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let sensor: Arc<dyn LocalSensor> = Arc::new(FixedSensor(20.0, 55.0));
        let reader = LocalWeatherReader::new(broker.clone(), sensor, Duration::from_secs(300));

        reader.poll_once().await;

        let reading: LocalWeatherReading = broker.get_json("weather:dht22:latest").await.unwrap().unwrap();
        assert_eq!(reading.temperature_c, 20.0);
        assert_eq!(reading.temperature_f, 68.0);
    }
}
