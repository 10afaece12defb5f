//! RemoteWeatherReader: polls an external observation API on a fixed
//! interval, writes the latest observation and a bounded 24h
//! time-series, and (§4.4) computes a local/remote correlation snapshot
//! whenever a fresh local reading exists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker::{Broker, BrokerJsonExt};
use crate::error::{Classify, ErrorKind};
use crate::types::{LocalWeatherReading, RemoteWeatherReading};

#[derive(Debug, Error)]
pub enum RemoteWeatherError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
    #[error("response could not be parsed: {0}")]
    Parse(String),
}

impl Classify for RemoteWeatherError {
    fn kind(&self) -> ErrorKind {
        // A missing remote observation degrades the pipeline (fields
        // stay null on the consolidated event) rather than failing it.
        ErrorKind::Degraded
    }
}

/// Capability handle for the external observation API. Production code
/// wraps `reqwest`; tests inject canned responses.
#[async_trait]
pub trait RemoteWeatherClient: Send + Sync {
    async fn fetch(&self) -> Result<RemoteWeatherReading, RemoteWeatherError>;
}

/// Shape of the subset of fields this system reads from a NWS-style
/// `/stations/{id}/observations/latest` response. Other fields are
/// ignored.
#[derive(Debug, Deserialize)]
struct StationResponse {
    properties: StationProperties,
}

#[derive(Debug, Deserialize)]
struct StationProperties {
    #[serde(rename = "textDescription")]
    text_description: Option<String>,
    temperature: Option<QuantityValue>,
    #[serde(rename = "relativeHumidity")]
    relative_humidity: Option<QuantityValue>,
    #[serde(rename = "windSpeed")]
    wind_speed: Option<QuantityValue>,
    visibility: Option<QuantityValue>,
    station: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuantityValue {
    value: Option<f64>,
}

pub struct ReqwestRemoteWeatherClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl ReqwestRemoteWeatherClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        ReqwestRemoteWeatherClient {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl RemoteWeatherClient for ReqwestRemoteWeatherClient {
    async fn fetch(&self) -> Result<RemoteWeatherReading, RemoteWeatherError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(&self.url).send())
            .await
            .map_err(|_| RemoteWeatherError::Timeout)?
            .map_err(|e| RemoteWeatherError::Request(e.to_string()))?;

        let parsed: StationResponse = response
            .json()
            .await
            .map_err(|e| RemoteWeatherError::Parse(e.to_string()))?;

        let props = parsed.properties;
        Ok(RemoteWeatherReading {
            timestamp: Utc::now(),
            text_description: props.text_description,
            temperature_c: props.temperature.and_then(|q| q.value),
            humidity_pct: props.relative_humidity.and_then(|q| q.value),
            wind_speed: props.wind_speed.and_then(|q| q.value),
            visibility: props.visibility.and_then(|q| q.value),
            station_id: props.station,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherCorrelationSnapshot {
    pub timestamp: chrono::DateTime<Utc>,
    pub local_temperature_c: f64,
    pub remote_temperature_c: Option<f64>,
    pub local_humidity_pct: f64,
    pub remote_humidity_pct: Option<f64>,
}

const REMOTE_LATEST_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const CORRELATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

pub struct RemoteWeatherReader {
    broker: Arc<dyn Broker>,
    client: Arc<dyn RemoteWeatherClient>,
    poll_interval: Duration,
    local_poll_interval: Duration,
    timeseries_window_secs: i64,
}

impl RemoteWeatherReader {
    pub fn new(
        broker: Arc<dyn Broker>,
        client: Arc<dyn RemoteWeatherClient>,
        poll_interval: Duration,
        local_poll_interval: Duration,
        timeseries_window_secs: i64,
    ) -> Self {
        RemoteWeatherReader {
            broker,
            client,
            poll_interval,
            local_poll_interval,
            timeseries_window_secs,
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
        let reading = match self.client.fetch().await {
            Ok(r) => r,
            Err(e) => {
                warn!(component = "remote_weather_reader", error = %e, "remote poll failed, keeping previous reading");
                return;
            }
        };

        if let Err(e) = self
            .broker
            .set_json("weather:airport:latest", &reading, Some(REMOTE_LATEST_TTL))
            .await
        {
            warn!(component = "remote_weather_reader", error = %e, "failed to update weather:airport:latest");
        }

        let score = reading.timestamp.timestamp() as f64;
        if let Ok(member) = serde_json::to_vec(&reading) {
            let key = "weather:airport:timeseries";
            if let Err(e) = self.broker.zadd(key, score, member, None).await {
                warn!(component = "remote_weather_reader", error = %e, "failed to append to weather timeseries");
            }
            let cutoff = score - self.timeseries_window_secs as f64;
            if let Err(e) = self.broker.zremrangebyscore(key, f64::MIN, cutoff).await {
                warn!(component = "remote_weather_reader", error = %e, "failed to prune weather timeseries");
            }
        }

        self.write_correlation_if_fresh(&reading).await;
    }

    async fn write_correlation_if_fresh(&self, remote: &RemoteWeatherReading) {
        let Ok(Some(local)) = self
            .broker
            .get_json::<LocalWeatherReading>("weather:dht22:latest")
            .await
        else {
            return;
        };

        let age = (Utc::now() - local.timestamp).num_seconds();
        let freshness_bound = 2 * self.local_poll_interval.as_secs() as i64;
        if age > freshness_bound {
            return;
        }

        let snapshot = WeatherCorrelationSnapshot {
            timestamp: Utc::now(),
            local_temperature_c: local.temperature_c,
            remote_temperature_c: remote.temperature_c,
            local_humidity_pct: local.humidity_pct,
            remote_humidity_pct: remote.humidity_pct,
        };

        if let Err(e) = self
            .broker
            .set_json("weather:correlation:local_remote", &snapshot, Some(CORRELATION_TTL))
            .await
        {
            warn!(component = "remote_weather_reader", error = %e, "failed to write weather correlation snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    struct FixedClient(RemoteWeatherReading);

    #[async_trait]
    impl RemoteWeatherClient for FixedClient {
        async fn fetch(&self) -> Result<RemoteWeatherReading, RemoteWeatherError> {
            Ok(self.0.clone())
        }
    }

    fn reading() -> RemoteWeatherReading {
        RemoteWeatherReading {
            timestamp: Utc::now(),
            text_description: Some("Clear".to_string()),
            temperature_c: Some(20.0),
            humidity_pct: Some(40.0),
            wind_speed: Some(5.0),
            visibility: Some(10.0),
            station_id: Some("KPHX".to_string()),
        }
    }

    #[tokio::test]
    async fn poll_writes_latest_and_timeseries() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let client: Arc<dyn RemoteWeatherClient> = Arc::new(FixedClient(reading()));
        let reader = RemoteWeatherReader::new(
            broker.clone(),
            client,
            Duration::from_secs(300),
            Duration::from_secs(300),
            24 * 3600,
        );

        reader.poll_once().await;

        let latest: RemoteWeatherReading = broker.get_json("weather:airport:latest").await.unwrap().unwrap();
        assert_eq!(latest.station_id.as_deref(), Some("KPHX"));

        let series = broker
            .zrange_by_score("weather:airport:timeseries", 0.0, f64::MAX)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
    }

    #[tokio::test]
    async fn correlation_written_when_local_reading_is_fresh() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let local = LocalWeatherReading {
            timestamp: Utc::now(),
            temperature_c: 18.0,
            temperature_f: 64.4,
            humidity_pct: 50.0,
        };
        broker.set_json("weather:dht22:latest", &local, None).await.unwrap();

        let client: Arc<dyn RemoteWeatherClient> = Arc::new(FixedClient(reading()));
        let reader = RemoteWeatherReader::new(
            broker.clone(),
            client,
            Duration::from_secs(300),
            Duration::from_secs(300),
            24 * 3600,
        );

        reader.poll_once().await;

        let snapshot: WeatherCorrelationSnapshot = broker
            .get_json("weather:correlation:local_remote")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.local_temperature_c, 18.0);
    }
}
