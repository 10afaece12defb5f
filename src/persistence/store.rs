//! The relational store: connection pooling, schema management, the
//! batched transactional writer used by the Persister, and the read
//! queries used by the API and Broadcaster.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::Serialize;
use thiserror::Error;

use crate::error::{Classify, ErrorKind};
use crate::types::ConsolidatedEvent;

use super::schema;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pool checkout failed: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// A row as returned to API clients: `traffic_detections` joined with
/// its optional radar and camera sub-rows.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRow {
    pub id: String,
    pub correlation_id: String,
    pub timestamp: f64,
    pub trigger_source: String,
    pub speed_mph: Option<f64>,
    pub alert_level: Option<String>,
    pub direction: Option<String>,
    pub vehicle_count: Option<i64>,
    pub primary_vehicle_type: Option<String>,
    pub detection_confidence: Option<f64>,
}

const DETECTION_ROW_SELECT: &str = "
    SELECT d.id, d.correlation_id, d.timestamp, d.trigger_source,
           r.speed_mph, r.alert_level, r.direction,
           c.vehicle_count, c.vehicle_types, c.detection_confidence
    FROM traffic_detections d
    LEFT JOIN radar_detections r ON r.detection_id = d.id
    LEFT JOIN camera_detections c ON c.detection_id = d.id
";

fn row_to_detection(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionRow> {
    Ok(DetectionRow {
        id: row.get(0)?,
        correlation_id: row.get(1)?,
        timestamp: row.get(2)?,
        trigger_source: row.get(3)?,
        speed_mph: row.get(4)?,
        alert_level: row.get(5)?,
        direction: row.get(6)?,
        vehicle_count: row.get(7)?,
        primary_vehicle_type: row.get(8)?,
        detection_confidence: row.get(9)?,
    })
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AnalyticsSummary {
    pub count: i64,
    pub mean_speed_mph: Option<f64>,
    pub min_speed_mph: Option<f64>,
    pub max_speed_mph: Option<f64>,
    pub over_limit_count: i64,
    pub hourly_distribution: Vec<(i64, i64)>,
    pub vehicle_type_distribution: Vec<(String, i64)>,
}

#[derive(Debug, Default)]
pub struct SearchCriteria {
    pub start_date: Option<f64>,
    pub end_date: Option<f64>,
    pub min_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub vehicle_type: Option<String>,
    pub limit: i64,
}

pub struct SqlStore {
    pool: Pool,
}

impl SqlStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = r2d2::Pool::new(manager)?;
        let conn = pool.get()?;
        schema::ensure_schema(&conn)?;
        Ok(SqlStore { pool })
    }

    pub fn health_check(&self) -> bool {
        self.pool
            .get()
            .ok()
            .and_then(|conn| conn.query_row("SELECT 1", [], |_| Ok(())).ok())
            .is_some()
    }

    /// Inserts one batch of consolidated events in a single
    /// transaction (§4.6 steps 1-5). Replaying an already-persisted
    /// batch is a no-op: `traffic_detections` and the two per-sensor
    /// tables reject duplicate `detection_id`s via `INSERT OR IGNORE`.
    pub fn insert_batch(&self, events: &[ConsolidatedEvent]) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        for event in events {
            tx.execute(
                "INSERT OR IGNORE INTO traffic_detections (id, correlation_id, timestamp, trigger_source) VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.consolidation_id,
                    event.correlation_id,
                    event.timestamp.timestamp() as f64,
                    event.trigger_source,
                ],
            )?;

            tx.execute(
                "INSERT OR IGNORE INTO radar_detections (detection_id, speed_mph, speed_mps, confidence, alert_level, direction) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.consolidation_id,
                    event.radar.speed_mph,
                    event.radar.speed_native,
                    event.radar.magnitude,
                    event.radar.alert_level.as_str(),
                    format!("{:?}", event.radar.direction).to_lowercase(),
                ],
            )?;

            if let Some(camera) = &event.camera {
                tx.execute(
                    "INSERT OR IGNORE INTO camera_detections (detection_id, vehicle_count, detection_confidence, vehicle_types, inference_time_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.consolidation_id,
                        camera.vehicle_count,
                        camera.detection_confidence,
                        camera.primary_vehicle_type.as_str(),
                        Option::<i64>::None,
                    ],
                )?;
            }

            if let Some(local) = &event.weather.local {
                let weather_id = upsert_weather(&tx, "local", local.timestamp, Some(local.temperature_c), Some(local.humidity_pct), None, None)?;
                link_weather(&tx, &event.consolidation_id, weather_id)?;
            }
            if let Some(remote) = &event.weather.remote {
                let weather_id = upsert_weather(
                    &tx,
                    "remote",
                    remote.timestamp,
                    remote.temperature_c,
                    remote.humidity_pct,
                    remote.text_description.as_deref(),
                    remote.wind_speed,
                )?;
                link_weather(&tx, &event.consolidation_id, weather_id)?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn recent(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<DetectionRow>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!("{DETECTION_ROW_SELECT} WHERE d.timestamp >= ?1 ORDER BY d.timestamp DESC LIMIT ?2");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![since.timestamp() as f64, limit], row_to_detection)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows with `rowid > last_seen_rowid`, for the Broadcaster's
    /// polling cursor. `traffic_detections.id` is the consolidation_id
    /// (not sortable), so the cursor rides SQLite's implicit `rowid`
    /// instead — an internal ordering detail, not a schema change.
    pub fn rows_after(&self, last_seen_rowid: i64, cap: i64) -> Result<Vec<(i64, DetectionRow)>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT d.rowid, d.id, d.correlation_id, d.timestamp, d.trigger_source, \
             r.speed_mph, r.alert_level, r.direction, c.vehicle_count, c.vehicle_types, c.detection_confidence \
             FROM traffic_detections d \
             LEFT JOIN radar_detections r ON r.detection_id = d.id \
             LEFT JOIN camera_detections c ON c.detection_id = d.id \
             WHERE d.rowid > ?1 ORDER BY d.rowid ASC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![last_seen_rowid, cap], |row| {
                let rowid: i64 = row.get(0)?;
                Ok((
                    rowid,
                    DetectionRow {
                        id: row.get(1)?,
                        correlation_id: row.get(2)?,
                        timestamp: row.get(3)?,
                        trigger_source: row.get(4)?,
                        speed_mph: row.get(5)?,
                        alert_level: row.get(6)?,
                        direction: row.get(7)?,
                        vehicle_count: row.get(8)?,
                        primary_vehicle_type: row.get(9)?,
                        detection_confidence: row.get(10)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn analytics(&self, since: DateTime<Utc>, low_threshold_mph: f64) -> Result<AnalyticsSummary, StoreError> {
        let conn = self.pool.get()?;
        let since_ts = since.timestamp() as f64;

        let (count, mean, min, max): (i64, Option<f64>, Option<f64>, Option<f64>) = conn.query_row(
            "SELECT count(*), avg(r.speed_mph), min(r.speed_mph), max(r.speed_mph)
             FROM traffic_detections d LEFT JOIN radar_detections r ON r.detection_id = d.id
             WHERE d.timestamp >= ?1",
            params![since_ts],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        let over_limit_count: i64 = conn.query_row(
            "SELECT count(*) FROM traffic_detections d JOIN radar_detections r ON r.detection_id = d.id
             WHERE d.timestamp >= ?1 AND r.speed_mph >= ?2",
            params![since_ts, low_threshold_mph],
            |row| row.get(0),
        )?;

        let mut hourly_stmt = conn.prepare(
            "SELECT CAST(strftime('%H', datetime(d.timestamp, 'unixepoch')) AS INTEGER) AS hour, count(*)
             FROM traffic_detections d WHERE d.timestamp >= ?1 GROUP BY hour ORDER BY hour",
        )?;
        let hourly_distribution = hourly_stmt
            .query_map(params![since_ts], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut vehicle_stmt = conn.prepare(
            "SELECT c.vehicle_types, count(*) FROM traffic_detections d
             JOIN camera_detections c ON c.detection_id = d.id
             WHERE d.timestamp >= ?1 GROUP BY c.vehicle_types",
        )?;
        let vehicle_type_distribution = vehicle_stmt
            .query_map(params![since_ts], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AnalyticsSummary {
            count,
            mean_speed_mph: mean,
            min_speed_mph: min,
            max_speed_mph: max,
            over_limit_count,
            hourly_distribution,
            vehicle_type_distribution,
        })
    }

    pub fn search(&self, criteria: &SearchCriteria) -> Result<Vec<DetectionRow>, StoreError> {
        let conn = self.pool.get()?;
        let mut sql = DETECTION_ROW_SELECT.to_string();
        let mut clauses = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(start) = criteria.start_date {
            clauses.push("d.timestamp >= ?".to_string());
            args.push(Box::new(start));
        }
        if let Some(end) = criteria.end_date {
            clauses.push("d.timestamp <= ?".to_string());
            args.push(Box::new(end));
        }
        if let Some(min_speed) = criteria.min_speed {
            clauses.push("r.speed_mph >= ?".to_string());
            args.push(Box::new(min_speed));
        }
        if let Some(max_speed) = criteria.max_speed {
            clauses.push("r.speed_mph <= ?".to_string());
            args.push(Box::new(max_speed));
        }
        if let Some(vt) = &criteria.vehicle_type {
            clauses.push("c.vehicle_types = ?".to_string());
            args.push(Box::new(vt.clone()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY d.timestamp DESC LIMIT ?");
        args.push(Box::new(criteria.limit));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_refs.as_slice(), row_to_detection)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn last_persist_timestamp(&self) -> Result<Option<f64>, StoreError> {
        let conn = self.pool.get()?;
        let ts: Option<f64> =
            conn.query_row("SELECT max(timestamp) FROM traffic_detections", [], |row| row.get(0))?;
        Ok(ts)
    }

    pub fn vacuum(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }
}

fn upsert_weather(
    tx: &rusqlite::Transaction<'_>,
    source: &str,
    timestamp: DateTime<Utc>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    conditions: Option<&str>,
    wind_speed: Option<f64>,
) -> rusqlite::Result<i64> {
    const TIME_BUCKET_SECS: i64 = 5 * 60;
    let time_bucket = (timestamp.timestamp() / TIME_BUCKET_SECS) * TIME_BUCKET_SECS;

    tx.execute(
        "INSERT INTO weather_conditions (source, time_bucket, temperature, humidity, conditions, wind_speed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source, time_bucket) DO UPDATE SET
            temperature = excluded.temperature,
            humidity = excluded.humidity,
            conditions = excluded.conditions,
            wind_speed = excluded.wind_speed",
        params![source, time_bucket, temperature, humidity, conditions, wind_speed],
    )?;

    tx.query_row(
        "SELECT id FROM weather_conditions WHERE source = ?1 AND time_bucket = ?2",
        params![source, time_bucket],
        |row| row.get(0),
    )
}

fn link_weather(tx: &rusqlite::Transaction<'_>, detection_id: &str, weather_id: i64) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO traffic_weather_correlation (detection_id, weather_id, correlation_strength) VALUES (?1, ?2, ?3)",
        params![detection_id, weather_id, Option::<f64>::None],
    )?;
    Ok(())
}

pub fn open_pooled(path: &Path) -> Result<Arc<SqlStore>, StoreError> {
    Ok(Arc::new(SqlStore::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertLevel, Direction, ProcessingMetadata, RadarSample, WeatherSnapshot};

    fn event(id: &str) -> ConsolidatedEvent {
        ConsolidatedEvent {
            consolidation_id: id.to_string(),
            correlation_id: format!("corr-{id}"),
            trigger_source: "radar".to_string(),
            timestamp: Utc::now(),
            radar: RadarSample {
                correlation_id: format!("corr-{id}"),
                timestamp: Utc::now(),
                speed_native: 25.5,
                speed_mph: 25.5,
                magnitude: 25.5,
                direction: Direction::Approaching,
                alert_level: AlertLevel::Low,
            },
            camera: None,
            weather: WeatherSnapshot { local: None, remote: None },
            metadata: ProcessingMetadata {
                producer_version: "test".to_string(),
                data_sources: vec!["radar".to_string()],
            },
        }
    }

    #[test]
    fn insert_batch_then_recent_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("test.db")).unwrap();
        store.insert_batch(&[event("a")]).unwrap();

        let rows = store.recent(Utc::now() - chrono::Duration::hours(1), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "a");
    }

    #[test]
    fn replaying_a_batch_does_not_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("test.db")).unwrap();
        let e = event("dup");
        store.insert_batch(&[e.clone()]).unwrap();
        store.insert_batch(&[e]).unwrap();

        let rows = store.recent(Utc::now() - chrono::Duration::hours(1), 10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn rows_after_respects_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("test.db")).unwrap();
        store.insert_batch(&[event("a"), event("b")]).unwrap();

        let first = store.rows_after(0, 10).unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first[0].0;
        let after = store.rows_after(cursor, 10).unwrap();
        assert_eq!(after.len(), 1);
    }
}
