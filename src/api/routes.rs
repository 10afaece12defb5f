//! REST handlers for the read-only traffic query API (§4.8).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::persistence::{SearchCriteria, StoreError};

use super::error::ApiError;
use super::state::AppState;

/// Maps a store failure to the response code spec.md §7 requires: a
/// pool checkout failure means the store is unreachable (503), any
/// other SQLite error is an internal fault (500).
fn map_store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::Pool(_) => ApiError::unavailable(e.to_string()),
        StoreError::Sqlite(_) => ApiError::internal(e.to_string()),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_reachable: bool,
    pub store_reachable: bool,
    pub last_persist_timestamp: Option<f64>,
    pub timestamp: chrono::DateTime<Utc>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker_reachable = state.broker.get("health:probe").await.is_ok();
    let store_reachable = state.store.health_check();
    let last_persist_timestamp = state.store.last_persist_timestamp().ok().flatten();

    Json(HealthResponse {
        status: if broker_reachable && store_reachable { "healthy" } else { "degraded" },
        broker_reachable,
        store_reachable,
        last_persist_timestamp,
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    hours: Option<i64>,
    limit: Option<i64>,
}

pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hours = query.hours.unwrap_or(24);
    if !(1..=168).contains(&hours) {
        return Err(ApiError::bad_request("hours", "must be between 1 and 168"));
    }
    let limit = query.limit.unwrap_or(100);
    if !(1..=1000).contains(&limit) {
        return Err(ApiError::bad_request("limit", "must be between 1 and 1000"));
    }

    let since = Utc::now() - Duration::hours(hours);
    let rows = state
        .store
        .recent(since, limit)
        .map_err(map_store_error)?;

    Ok(Json(json!({
        "hours": hours,
        "limit": limit,
        "count": rows.len(),
        "detections": rows,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    days: Option<i64>,
}

pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let days = query.days.unwrap_or(7);
    if !(1..=30).contains(&days) {
        return Err(ApiError::bad_request("days", "must be between 1 and 30"));
    }

    let since = Utc::now() - Duration::days(days);
    let threshold = crate::config::get().radar.high_speed_threshold_mph;
    let summary = state
        .store
        .analytics(since, threshold)
        .map_err(map_store_error)?;

    Ok(Json(json!({ "days": days, "summary": summary })))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    period: Option<String>,
}

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let period = query.period.as_deref().unwrap_or("day");
    let since = match period {
        "day" => Utc::now() - Duration::days(1),
        "week" => Utc::now() - Duration::days(7),
        "month" => Utc::now() - Duration::days(30),
        _ => return Err(ApiError::bad_request("period", "must be one of day, week, month")),
    };

    let threshold = crate::config::get().radar.high_speed_threshold_mph;
    let result = state
        .store
        .analytics(since, threshold)
        .map_err(map_store_error)?;

    Ok(Json(json!({ "period": period, "analytics": result })))
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchQuery {
    start_date: Option<f64>,
    end_date: Option<f64>,
    min_speed: Option<f64>,
    max_speed: Option<f64>,
    vehicle_type: Option<String>,
    limit: Option<i64>,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.start_date.is_none()
        && query.end_date.is_none()
        && query.min_speed.is_none()
        && query.max_speed.is_none()
        && query.vehicle_type.is_none()
    {
        return Err(ApiError::bad_request(
            "criteria",
            "at least one search criterion is required",
        ));
    }

    let limit = query.limit.unwrap_or(100);
    if !(1..=1000).contains(&limit) {
        return Err(ApiError::bad_request("limit", "must be between 1 and 1000"));
    }

    if let (Some(min), Some(max)) = (query.min_speed, query.max_speed) {
        if min > max {
            return Err(ApiError::bad_request("min_speed", "must not exceed max_speed"));
        }
    }

    let criteria = SearchCriteria {
        start_date: query.start_date,
        end_date: query.end_date,
        min_speed: query.min_speed,
        max_speed: query.max_speed,
        vehicle_type: query.vehicle_type,
        limit,
    };

    let rows = state
        .store
        .search(&criteria)
        .map_err(map_store_error)?;

    Ok(Json(json!({ "count": rows.len(), "detections": rows })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::{self, ApiConfig, AppConfig};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn ensure_config() {
        let _ = config::init(AppConfig::from_env());
    }

    fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::persistence::SqlStore::open(&dir.path().join("test.db")).unwrap());
        Arc::new(AppState {
            broker: Arc::new(InMemoryBroker::new()),
            store,
            config: ApiConfig {
                bind_addr: "127.0.0.1".to_string(),
                port: 0,
                allowed_origins: vec![],
                ws_high_water_mark: 256,
                ws_ping_interval_secs: 30,
            },
        })
    }

    #[tokio::test]
    async fn recent_rejects_out_of_range_hours() {
        ensure_config();
        let app = Router::new()
            .route("/traffic/recent", get(recent))
            .with_state(test_state());

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/traffic/recent?hours=500")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_requires_at_least_one_criterion() {
        ensure_config();
        let app = Router::new()
            .route("/traffic/search", get(search))
            .with_state(test_state());

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/traffic/search")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_rejects_min_speed_greater_than_max_speed() {
        ensure_config();
        let app = Router::new()
            .route("/traffic/search", get(search))
            .with_state(test_state());

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/traffic/search?min_speed=60&max_speed=30")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_all_three_subsystem_fields() {
        ensure_config();
        let response = health(State(test_state())).await;
        assert!(response.broker_reachable);
        assert!(response.store_reachable);
        assert_eq!(response.last_persist_timestamp, None);
    }
}
