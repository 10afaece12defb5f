//! The camera delivery substrate is an implementation choice, not a
//! contract (§4.3, §9 open question). [`CameraSource`] is the seam: one
//! trait, two implementations, selected by [`crate::config::CameraSourceConfig`]
//! so the rest of the component never branches on which substrate is in
//! use.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Broker;

/// One detection as produced by the external on-device inference
/// process (§6: "timestamp, list of `{class, confidence, bbox}`").
#[derive(Debug, Clone, Deserialize)]
pub struct RawDetection {
    pub class: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawDetectionBatch {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub detections: Vec<RawDetection>,
    /// Frame dimensions, needed to convert pixel bounding boxes into
    /// the fractional coordinates the ROI filter expects.
    pub frame_width: f64,
    pub frame_height: f64,
}

#[async_trait]
pub trait CameraSource: Send {
    /// Waits for and returns the next detection batch, or `None` once
    /// `cancel` fires.
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Option<RawDetectionBatch>;
}

/// Default substrate: the external inference process publishes raw
/// detections on an internal broker channel.
pub struct BrokerCameraSource {
    rx: tokio::sync::broadcast::Receiver<Vec<u8>>,
}

/// Internal, not part of the closed public channel set in §4.1 — this
/// carries the *raw* producer feed that `CameraReader` consumes and
/// filters before publishing the real `traffic:camera` summary.
pub const RAW_DETECTIONS_CHANNEL: &str = "camera:raw:detections";

impl BrokerCameraSource {
    pub fn new(broker: &Arc<dyn Broker>) -> Self {
        BrokerCameraSource {
            rx: broker.subscribe(RAW_DETECTIONS_CHANNEL),
        }
    }
}

#[async_trait]
impl CameraSource for BrokerCameraSource {
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Option<RawDetectionBatch> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                msg = self.rx.recv() => match msg {
                    Ok(bytes) => match serde_json::from_slice(&bytes) {
                        Ok(batch) => return Some(batch),
                        Err(e) => {
                            warn!(component = "camera_reader", error = %e, "malformed detection batch, skipping");
                            continue;
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(component = "camera_reader", skipped, "detection feed lagged, skipping");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// File-drop substrate: polls a directory's modification time for new
/// `*.json` files, same no-dependency polling idiom the config watcher
/// uses for hot-reload. Each file is one [`RawDetectionBatch`]; files
/// are removed once consumed.
pub struct FileDropCameraSource {
    directory: PathBuf,
    poll_interval: Duration,
}

impl FileDropCameraSource {
    pub fn new(directory: PathBuf) -> Self {
        FileDropCameraSource {
            directory,
            poll_interval: Duration::from_millis(500),
        }
    }

    fn oldest_pending_file(dir: &Path) -> Option<PathBuf> {
        let mut entries: Vec<(SystemTime, PathBuf)> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|ext| ext == "json").unwrap_or(false))
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((modified, e.path()))
            })
            .collect();
        entries.sort_by_key(|(t, _)| *t);
        entries.into_iter().next().map(|(_, p)| p)
    }
}

#[async_trait]
impl CameraSource for FileDropCameraSource {
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Option<RawDetectionBatch> {
        loop {
            if let Some(path) = Self::oldest_pending_file(&self.directory) {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        let _ = std::fs::remove_file(&path);
                        match serde_json::from_str(&contents) {
                            Ok(batch) => return Some(batch),
                            Err(e) => {
                                warn!(component = "camera_reader", path = %path.display(), error = %e, "malformed detection file, skipping");
                                continue;
                            }
                        }
                    }
                    Err(e) => {
                        debug!(component = "camera_reader", path = %path.display(), error = %e, "failed to read detection file");
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
