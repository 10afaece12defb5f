//! Maintenance (§4.9): housekeeping tasks that keep the broker and
//! filesystem bounded over long uptimes — TTL re-assertion, capture
//! directory pruning, and periodic store compaction.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::broker::Broker;
use crate::config::MaintenanceConfig;
use crate::persistence::SqlStore;

const HOURLY: Duration = Duration::from_secs(60 * 60);
const WEEKLY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// `(key glob, ttl)` reasserted every hour so a key whose TTL was
/// somehow never applied (e.g. a broker restart that lost in-flight
/// writes) doesn't linger forever.
const TTL_POLICY: &[(&str, Duration)] = &[
    ("radar:latest", Duration::from_secs(5 * 60)),
    ("camera:latest", Duration::from_secs(10)),
    ("weather:dht22:latest", Duration::from_secs(30 * 60)),
    ("weather:airport:latest", Duration::from_secs(2 * 60 * 60)),
    ("consolidation:latest", Duration::from_secs(60 * 60)),
    ("consolidation:history", Duration::from_secs(48 * 60 * 60)),
];

pub struct Maintenance {
    broker: Arc<dyn Broker>,
    store: Arc<SqlStore>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<SqlStore>, config: MaintenanceConfig) -> Self {
        Maintenance { broker, store, config }
    }

    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut hourly = tokio::time::interval(HOURLY);
        let mut weekly = tokio::time::interval(WEEKLY);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = hourly.tick() => {
                    self.sweep_ttls().await;
                    self.prune_captures().await;
                    self.update_stats().await;
                }
                _ = weekly.tick() => {
                    self.vacuum_store().await;
                }
            }
        }
    }

    async fn sweep_ttls(&self) {
        for (pattern, ttl) in TTL_POLICY {
            let keys = match self.broker.keys_matching(pattern).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(component = "maintenance", pattern = %pattern, error = %e, "failed to list keys for TTL sweep");
                    continue;
                }
            };
            for key in keys {
                if let Err(e) = self.broker.apply_ttl(&key, *ttl).await {
                    warn!(component = "maintenance", %key, error = %e, "failed to reapply TTL");
                }
            }
        }
    }

    /// Removes capture files older than the configured max age. If free
    /// disk space is below the configured threshold, runs a second pass
    /// with the age threshold halved to recover space more aggressively.
    async fn prune_captures(&self) {
        let dir = self.config.capture_dir.clone();
        let max_age_hours = self.config.image_max_age_hours;
        let disk_threshold = self.config.disk_free_pct_threshold;

        let removed = tokio::task::spawn_blocking(move || prune_dir(&dir, max_age_hours))
            .await
            .unwrap_or(0);
        info!(component = "maintenance", removed, "pruned capture directory");

        if let Some(free_pct) = disk_free_pct(&self.config.capture_dir) {
            if free_pct < disk_threshold {
                let dir = self.config.capture_dir.clone();
                let emergency_age = (max_age_hours / 2).max(1);
                let removed = tokio::task::spawn_blocking(move || prune_dir(&dir, emergency_age))
                    .await
                    .unwrap_or(0);
                warn!(
                    component = "maintenance",
                    free_pct, removed, "low disk space, ran emergency capture prune"
                );
            }
        }
    }

    async fn vacuum_store(&self) {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || store.vacuum()).await;
        match result {
            Ok(Ok(())) => info!(component = "maintenance", "store vacuum complete"),
            Ok(Err(e)) => warn!(component = "maintenance", error = %e, "store vacuum failed"),
            Err(e) => warn!(component = "maintenance", error = %e, "store vacuum task panicked"),
        }
    }

    async fn update_stats(&self) {
        let fields = vec![
            ("last_sweep_at".to_string(), chrono::Utc::now().timestamp().to_string().into_bytes()),
        ];
        if let Err(e) = self.broker.hset("stats:maintenance", fields, None).await {
            warn!(component = "maintenance", error = %e, "failed to update stats:maintenance");
        }
    }
}

fn prune_dir(dir: &Path, max_age_hours: i64) -> usize {
    let cutoff = std::time::SystemTime::now() - Duration::from_secs(max_age_hours.max(0) as u64 * 60 * 60);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if modified < cutoff && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Percentage (0-100) of free disk space on the filesystem containing
/// `dir`, via `statvfs`. `None` if the path can't be queried (e.g. not
/// yet created).
fn disk_free_pct(dir: &Path) -> Option<f64> {
    use std::mem::MaybeUninit;

    let c_path = std::ffi::CString::new(dir.to_str()?).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let result = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if result != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    if stat.f_blocks == 0 {
        return None;
    }
    Some(100.0 * stat.f_bfree as f64 / stat.f_blocks as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use std::fs;

    #[tokio::test]
    async fn sweep_applies_ttl_to_matching_keys() {
        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        broker.set("radar:latest", b"x".to_vec(), None).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqlStore::open(&dir.path().join("test.db")).unwrap());
        let maintenance = Maintenance::new(broker.clone(), store, test_config(&dir));

        maintenance.sweep_ttls().await;
        assert!(broker.get("radar:latest").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_removes_files_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let old_file = dir.path().join("old.jpg");
        let file = fs::File::create(&old_file).unwrap();
        let old_time = std::time::SystemTime::now() - Duration::from_secs(10 * 60 * 60);
        file.set_modified(old_time).unwrap();
        drop(file);

        let removed = prune_dir(dir.path(), 1);
        assert_eq!(removed, 1);
        assert!(!old_file.exists());
    }

    fn test_config(dir: &tempfile::TempDir) -> MaintenanceConfig {
        MaintenanceConfig {
            capture_dir: dir.path().to_path_buf(),
            image_max_age_hours: 24,
            disk_free_pct_threshold: 0.1,
        }
    }
}
