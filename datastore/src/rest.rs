use crate::errors::Error;
use crate::model::{DeviceDataResponse, DeviceReading, HistoryPoint, LatestProperties};
use crate::store::{history, latest_properties, DeviceDataStore};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

const MAX_COUNT: usize = 1000;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn DeviceDataStore>,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    saved: bool,
}

pub fn create_router(store: Arc<dyn DeviceDataStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route(
            "/api/v1/devices/:device_id/data/:metric",
            get(get_device_data).post(save_device_data),
        )
        .route("/api/v1/devices/:device_id/latest", get(get_latest))
        .route(
            "/api/v1/devices/:device_id/history/:metric",
            get(get_history),
        )
        .with_state(state)
}

async fn get_device_data(
    State(state): State<AppState>,
    Path((device_id, metric)): Path<(String, String)>,
    Query(params): Query<CountQuery>,
) -> Result<Json<DeviceDataResponse>, AppError> {
    let count = params.count.map(|c| c.min(MAX_COUNT));
    let rows = state.store.get(&metric, &device_id, count).await?;

    Ok(Json(DeviceDataResponse {
        total: rows.len(),
        data: rows,
        count,
    }))
}

async fn save_device_data(
    State(state): State<AppState>,
    Path((device_id, metric)): Path<(String, String)>,
    Json(reading): Json<DeviceReading>,
) -> Result<Json<SaveResponse>, AppError> {
    let saved = state.store.save(&device_id, &metric, &reading).await?;
    Ok(Json(SaveResponse { saved }))
}

async fn get_latest(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<LatestProperties>, AppError> {
    let latest = latest_properties(state.store.as_ref(), &device_id, Utc::now()).await?;
    Ok(Json(latest))
}

async fn get_history(
    State(state): State<AppState>,
    Path((device_id, metric)): Path<(String, String)>,
    Query(params): Query<CountQuery>,
) -> Result<Json<Vec<HistoryPoint>>, AppError> {
    let count = params.count.map(|c| c.min(MAX_COUNT));
    let points = history(state.store.as_ref(), &metric, &device_id, count).await?;
    Ok(Json(points))
}

enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", e),
                )
                    .into_response()
            }
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(anyhow::anyhow!("Device data request failed: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_validation_maps_to_bad_request() {
        let response = AppError::from(Error::Validation("bad".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_errors_map_to_500() {
        let response = AppError::from(Error::ChannelSend).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_save_then_get_handlers() {
        let store: Arc<dyn DeviceDataStore> = Arc::new(MemoryStore::new());
        let state = AppState { store };
        let path = || Path(("debugrobID".to_string(), "tempC".to_string()));

        let Json(saved) = save_device_data(
            State(state.clone()),
            path(),
            Json(DeviceReading::new("24.0", "SHT25-Top", "2019-07-18T22:57:01Z")),
        )
        .await
        .ok()
        .unwrap();
        assert!(saved.saved);

        let Json(response) = get_device_data(
            State(state.clone()),
            path(),
            Query(CountQuery { count: Some(1) }),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.data[0].data.name, "SHT25-Top");

        let Json(latest) = get_latest(State(state), Path("debugrobID".to_string()))
            .await
            .ok()
            .unwrap();
        assert_eq!(latest.boot_time, "");
        assert_eq!(latest.minutes_since_boot, None);
    }
}
