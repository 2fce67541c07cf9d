// 配置管理API

use crate::config::{EngineConfig, QueueConfigPatch};
use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use tracing::{error, info};

use super::ApiResponse;

/// GET /api/v1/config
/// 获取当前配置（队列部分为运行时值）
pub async fn get_config(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<EngineConfig>>, StatusCode> {
    let mut config = app_state.config.read().await.clone();
    config.queue = app_state.coordinator.config();
    Ok(Json(ApiResponse::success(config)))
}

/// PUT /api/v1/config
/// 部分更新队列配置，立即生效
pub async fn update_config(
    State(app_state): State<AppState>,
    Json(patch): Json<QueueConfigPatch>,
) -> Result<Json<ApiResponse<EngineConfig>>, StatusCode> {
    let queue = match app_state.coordinator.update_config(patch) {
        Ok(queue) => queue,
        Err(e) => {
            error!("更新队列配置失败: {}", e);
            return Ok(Json(ApiResponse::from_upload_error(&e)));
        }
    };

    let mut config = app_state.config.write().await;
    config.queue = queue;

    if let Some(path) = app_state.config_path.as_deref() {
        if let Err(e) = config.save_to_file(path).await {
            error!("保存配置失败: {:#}", e);
            return Ok(Json(ApiResponse::error(
                500,
                format!("配置已生效，但写回文件失败: {:#}", e),
            )));
        }
    }

    info!("队列配置已更新");
    Ok(Json(ApiResponse::success(config.clone())))
}
