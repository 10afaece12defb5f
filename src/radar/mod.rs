//! RadarReader (§4.2): reads framed ASCII/JSON lines from a serial
//! port, parses speed and magnitude, classifies alert level, and
//! publishes motion events.
//!
//! Represented as an explicit state machine
//! (`Disconnected → Connecting → Reading → Backoff`) driven by a
//! cancellable select over timer and I/O events, replacing the
//! `while True: sleep` polling loop the source used — the same
//! reconnect-with-backoff shape as the acquisition layer's
//! `WitsClient`, adapted from a TCP client to a serial port.

pub mod frame;
pub mod units;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{channels, Broker, BrokerJsonExt};
use crate::config::RadarConfig;
use crate::correlation::new_correlation_id;
use crate::error::{Classify, ErrorKind};
use crate::types::{AlertLevel, Direction, RadarSample};

const RADAR_LATEST_TTL: Duration = Duration::from_secs(5 * 60);
const RADAR_HISTORY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RadarError {
    #[error("failed to open serial port {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial read error: {0}")]
    ReadError(#[source] std::io::Error),
    #[error("serial read timed out")]
    Timeout,
}

impl Classify for RadarError {
    fn kind(&self) -> ErrorKind {
        match self {
            RadarError::OpenFailed { .. } | RadarError::ReadError(_) | RadarError::Timeout => {
                ErrorKind::Transient
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RadarStats {
    pub frames_parsed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

enum ReaderState {
    Disconnected,
    Connecting,
    Reading(tokio_serial::SerialStream),
    Backoff(Duration),
}

pub struct RadarReader {
    broker: Arc<dyn Broker>,
    config: RadarConfig,
    stats: Arc<RadarStats>,
}

impl RadarReader {
    pub fn new(broker: Arc<dyn Broker>, config: RadarConfig) -> Self {
        RadarReader {
            broker,
            config,
            stats: Arc::new(RadarStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RadarStats> {
        self.stats.clone()
    }

    /// Drives the reader's state machine until `cancel` fires. Every
    /// transient error (open failure, read error, timeout) moves the
    /// reader to `Backoff` rather than returning — the reader keeps
    /// running across all transient errors per §4.2.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut state = ReaderState::Disconnected;
        let mut backoff = INITIAL_RECONNECT_DELAY;

        loop {
            if cancel.is_cancelled() {
                info!(component = "radar_reader", "shutting down");
                return;
            }

            state = match state {
                ReaderState::Disconnected => ReaderState::Connecting,
                ReaderState::Connecting => match self.connect().await {
                    Ok(stream) => {
                        backoff = INITIAL_RECONNECT_DELAY;
                        ReaderState::Reading(stream)
                    }
                    Err(e) => {
                        warn!(component = "radar_reader", error = %e, "connect failed");
                        ReaderState::Backoff(backoff)
                    }
                },
                ReaderState::Reading(stream) => {
                    self.read_loop(stream, &cancel).await;
                    ReaderState::Backoff(backoff)
                }
                ReaderState::Backoff(delay) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    backoff = (delay * 2).min(MAX_RECONNECT_DELAY);
                    ReaderState::Connecting
                }
            };
        }
    }

    async fn connect(&self) -> Result<tokio_serial::SerialStream, RadarError> {
        let mut stream = tokio_serial::new(&self.config.port, self.config.baud)
            .timeout(Duration::from_secs(self.config.read_timeout_secs))
            .open_native_async()
            .map_err(|e| RadarError::OpenFailed {
                port: self.config.port.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;

        for command in &self.config.startup_commands {
            let line = format!("{command}\r\n");
            if let Err(e) = stream.write_all(line.as_bytes()).await {
                debug!(command = %command, error = %e, "startup command not acknowledged, continuing");
            }
        }

        info!(port = %self.config.port, baud = self.config.baud, "radar serial port connected");
        Ok(stream)
    }

    async fn read_loop(&self, stream: tokio_serial::SerialStream, cancel: &CancellationToken) {
        let mut reader = BufReader::new(stream).lines();
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(read_timeout, reader.next_line()) => result,
            };

            match line {
                Ok(Ok(Some(line))) => self.handle_line(&line).await,
                Ok(Ok(None)) => {
                    warn!(component = "radar_reader", "serial port closed by peer");
                    return;
                }
                Ok(Err(e)) => {
                    error!(component = "radar_reader", error = %e, "serial read error");
                    return;
                }
                Err(_) => {
                    debug!(component = "radar_reader", "read timed out, retrying");
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let Some(parsed) = frame::parse_frame(line) else {
            debug!(component = "radar_reader", line, "frame did not match any known format, dropping");
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.stats.frames_parsed.fetch_add(1, Ordering::Relaxed);

        let signed_mph = parsed.unit.to_mph(parsed.signed_speed);
        let abs_mph = signed_mph.abs();

        let sample = RadarSample {
            correlation_id: new_correlation_id(),
            timestamp: Utc::now(),
            speed_native: parsed.signed_speed,
            speed_mph: abs_mph,
            magnitude: parsed.magnitude,
            direction: Direction::from_signed_speed(signed_mph),
            alert_level: AlertLevel::classify(
                abs_mph,
                self.config.low_speed_threshold_mph,
                self.config.high_speed_threshold_mph,
            ),
        };

        self.record_and_publish(sample).await;
    }

    async fn record_and_publish(&self, sample: RadarSample) {
        if let Err(e) = self
            .broker
            .set_json(
                "radar:latest",
                &sample,
                Some(RADAR_LATEST_TTL),
            )
            .await
        {
            warn!(component = "radar_reader", error = %e, "failed to update radar:latest");
        }

        let history_key = format!("radar:history:{}", sample.timestamp.format("%Y%m%d"));
        let score = sample.timestamp.timestamp() as f64;
        if let Ok(member) = serde_json::to_vec(&sample) {
            if let Err(e) = self
                .broker
                .zadd(&history_key, score, member, Some(RADAR_HISTORY_TTL))
                .await
            {
                warn!(component = "radar_reader", error = %e, "failed to append to radar history");
            }
        }

        if sample.speed_mph < self.config.motion_threshold_mph {
            debug!(
                component = "radar_reader",
                correlation_id = %sample.correlation_id,
                speed_mph = sample.speed_mph,
                "below motion threshold, not publishing"
            );
            return;
        }

        if let Err(e) = self.broker.publish_json(channels::RADAR, &sample).await {
            warn!(component = "radar_reader", error = %e, "failed to publish radar sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn test_config() -> RadarConfig {
        RadarConfig {
            port: "/dev/null".to_string(),
            baud: 19200,
            read_timeout_secs: 2,
            low_speed_threshold_mph: 15.0,
            high_speed_threshold_mph: 45.0,
            motion_threshold_mph: 2.0,
            startup_commands: vec![],
        }
    }

    #[tokio::test]
    async fn below_motion_threshold_updates_latest_but_does_not_publish() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let reader = RadarReader::new(broker.clone(), test_config());
        let mut rx = broker.subscribe(channels::RADAR);

        let parsed = frame::parse_frame("1.2 mph").unwrap();
        assert!(parsed.signed_speed.abs() < 2.0);

        reader.handle_line("1.2 mph").await;

        assert!(broker.get("radar:latest").await.unwrap().is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn above_motion_threshold_publishes_and_classifies_high() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let reader = RadarReader::new(broker.clone(), test_config());
        let mut rx = broker.subscribe(channels::RADAR);

        reader.handle_line(r#"{"speed": 50.0, "unit": "mph"}"#).await;

        let payload = rx.try_recv().expect("expected a published sample");
        let sample: RadarSample = serde_json::from_slice(&payload).unwrap();
        assert_eq!(sample.alert_level, AlertLevel::High);
        assert_eq!(sample.speed_mph, 50.0);
    }

    #[tokio::test]
    async fn unparsable_line_is_dropped() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        let reader = RadarReader::new(broker.clone(), test_config());
        reader.handle_line("not a frame at all ???").await;
        assert_eq!(reader.stats.frames_dropped.load(Ordering::Relaxed), 1);
    }
}
