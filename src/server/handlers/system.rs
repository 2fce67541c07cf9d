// 指标与健康检查API

use crate::network::NetworkMetrics;
use crate::optimizer::PerformanceMetrics;
use crate::server::AppState;
use crate::uploader::QueueStatus;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};

use super::ApiResponse;

/// 指标响应
#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub performance: PerformanceMetrics,
    pub network: NetworkMetrics,
    pub queue: QueueStatus,
}

/// 健康检查响应
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// 协调器是否已关闭
    pub closed: bool,
}

/// GET /api/v1/metrics
pub async fn get_metrics(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<MetricsResponse>>, StatusCode> {
    let coordinator = &app_state.coordinator;
    Ok(Json(ApiResponse::success(MetricsResponse {
        performance: coordinator.metrics(),
        network: coordinator.network_metrics(),
        queue: coordinator.get_status().await,
    })))
}

/// GET /api/v1/health
pub async fn health_check(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<HealthResponse>>, StatusCode> {
    let closed = app_state.coordinator.is_closed();
    Ok(Json(ApiResponse::success(HealthResponse {
        status: if closed { "closing" } else { "ok" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: app_state.started_at.elapsed().as_secs(),
        closed,
    })))
}
