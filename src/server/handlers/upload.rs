use crate::server::AppState;
use crate::uploader::{
    FilePayload, PayloadHandle, QueueStatus, SessionContext, SubmitRequest, TaskSnapshot,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::ApiResponse;

/// 创建上传任务请求
#[derive(Debug, Deserialize)]
pub struct CreateUploadRequest {
    /// 本地文件路径
    pub path: String,
    /// 调用方会话
    pub session: SessionContext,
    /// 数值越小越优先
    #[serde(default)]
    pub priority: Option<i32>,
}

/// 批量操作结果
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchOperationResponse {
    /// 实际生效的任务数
    pub affected: usize,
}

/// POST /api/v1/uploads
/// 创建上传任务
pub async fn create_upload(
    State(app_state): State<AppState>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    let payload = match FilePayload::open(&req.path).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!("打开上传文件失败: {:#}", e);
            return Ok(Json(ApiResponse::error(400, format!("{:#}", e))));
        }
    };
    let payload: PayloadHandle = Arc::new(payload);

    let mut request = SubmitRequest::new(payload, req.session);
    if let Some(priority) = req.priority {
        request = request.with_priority(priority);
    }

    match app_state.coordinator.submit_request(request) {
        Ok(task_id) => {
            info!("创建上传任务成功: {} ({})", task_id, req.path);
            Ok(Json(ApiResponse::success(task_id)))
        }
        Err(e) => {
            error!("创建上传任务失败: {}", e);
            Ok(Json(ApiResponse::from_upload_error(&e)))
        }
    }
}

/// GET /api/v1/uploads
/// 获取所有上传任务
pub async fn get_all_uploads(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<TaskSnapshot>>>, StatusCode> {
    let tasks = app_state.coordinator.list_tasks().await;
    Ok(Json(ApiResponse::success(tasks)))
}

/// GET /api/v1/uploads/status
/// 获取队列状态统计
pub async fn get_queue_status(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<QueueStatus>>, StatusCode> {
    Ok(Json(ApiResponse::success(
        app_state.coordinator.get_status().await,
    )))
}

/// GET /api/v1/uploads/:id
/// 获取指定上传任务
pub async fn get_upload(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskSnapshot>>, StatusCode> {
    match app_state.coordinator.get_task(&task_id).await {
        Some(task) => Ok(Json(ApiResponse::success(task))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// POST /api/v1/uploads/:id/pause
/// 暂停上传任务
pub async fn pause_upload(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    match app_state.coordinator.pause(&task_id).await {
        Ok(()) => Ok(Json(ApiResponse::success("已暂停".to_string()))),
        Err(e) => {
            warn!("暂停上传任务失败: {}", e);
            Ok(Json(ApiResponse::from_upload_error(&e)))
        }
    }
}

/// POST /api/v1/uploads/:id/resume
/// 恢复上传任务
pub async fn resume_upload(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    match app_state.coordinator.resume(&task_id).await {
        Ok(()) => Ok(Json(ApiResponse::success("已恢复".to_string()))),
        Err(e) => {
            warn!("恢复上传任务失败: {}", e);
            Ok(Json(ApiResponse::from_upload_error(&e)))
        }
    }
}

/// POST /api/v1/uploads/:id/cancel
/// 取消上传任务
pub async fn cancel_upload(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    match app_state.coordinator.cancel(&task_id).await {
        Ok(()) => Ok(Json(ApiResponse::success("已取消".to_string()))),
        Err(e) => {
            warn!("取消上传任务失败: {}", e);
            Ok(Json(ApiResponse::from_upload_error(&e)))
        }
    }
}

/// POST /api/v1/uploads/pause-all
/// 暂停全部上传任务
pub async fn pause_all_uploads(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<BatchOperationResponse>>, StatusCode> {
    let affected = app_state.coordinator.pause_all().await;
    Ok(Json(ApiResponse::success(BatchOperationResponse { affected })))
}

/// POST /api/v1/uploads/resume-all
/// 恢复全部上传任务
pub async fn resume_all_uploads(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<BatchOperationResponse>>, StatusCode> {
    let affected = app_state.coordinator.resume_all().await;
    Ok(Json(ApiResponse::success(BatchOperationResponse { affected })))
}

/// POST /api/v1/uploads/clear
/// 清除已结束任务的快照
pub async fn clear_finished_uploads(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<BatchOperationResponse>>, StatusCode> {
    let affected = app_state.coordinator.clear_finished();
    Ok(Json(ApiResponse::success(BatchOperationResponse { affected })))
}
