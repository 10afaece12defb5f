//! The five-table normalized schema from §6, created with
//! CREATE-IF-NOT-EXISTS statements and the indices §4.6 names.

use rusqlite::Connection;

pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS traffic_detections (
            id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            timestamp REAL NOT NULL,
            trigger_source TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS radar_detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            detection_id TEXT NOT NULL UNIQUE REFERENCES traffic_detections(id),
            speed_mph REAL NOT NULL,
            speed_mps REAL NOT NULL,
            confidence REAL,
            alert_level TEXT NOT NULL,
            direction TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS camera_detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            detection_id TEXT NOT NULL UNIQUE REFERENCES traffic_detections(id),
            vehicle_count INTEGER NOT NULL,
            detection_confidence REAL NOT NULL,
            vehicle_types TEXT NOT NULL,
            inference_time_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS weather_conditions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            time_bucket INTEGER NOT NULL,
            temperature REAL,
            humidity REAL,
            conditions TEXT,
            wind_speed REAL,
            UNIQUE(source, time_bucket)
        );

        CREATE TABLE IF NOT EXISTS traffic_weather_correlation (
            detection_id TEXT NOT NULL REFERENCES traffic_detections(id),
            weather_id INTEGER NOT NULL REFERENCES weather_conditions(id),
            correlation_strength REAL,
            PRIMARY KEY (detection_id, weather_id)
        );

        CREATE INDEX IF NOT EXISTS idx_traffic_detections_timestamp ON traffic_detections(timestamp);
        CREATE INDEX IF NOT EXISTS idx_radar_detections_detection_id ON radar_detections(detection_id);
        CREATE INDEX IF NOT EXISTS idx_camera_detections_detection_id ON camera_detections(detection_id);
        CREATE INDEX IF NOT EXISTS idx_weather_conditions_source_bucket ON weather_conditions(source, time_bucket);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creation_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        ensure_schema(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }
}
