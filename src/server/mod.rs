// Web服务器模块
//
// 上传队列的 HTTP / WebSocket 控制面，统一挂载在 /api/v1 下

pub mod handlers;
pub mod state;
pub mod websocket;

pub use state::AppState;

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// 构建控制面路由
pub fn build_router(app_state: AppState) -> Router {
    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // API 路由
    let api_routes = Router::new()
        // 上传API
        .route(
            "/uploads",
            post(handlers::create_upload).get(handlers::get_all_uploads),
        )
        .route("/uploads/status", get(handlers::get_queue_status))
        .route("/uploads/pause-all", post(handlers::pause_all_uploads))
        .route("/uploads/resume-all", post(handlers::resume_all_uploads))
        .route("/uploads/clear", post(handlers::clear_finished_uploads))
        .route("/uploads/:id", get(handlers::get_upload))
        .route("/uploads/:id/pause", post(handlers::pause_upload))
        .route("/uploads/:id/resume", post(handlers::resume_upload))
        .route("/uploads/:id/cancel", post(handlers::cancel_upload))
        // 配置API
        .route(
            "/config",
            get(handlers::get_config).put(handlers::update_config),
        )
        // 指标与健康检查
        .route("/metrics", get(handlers::get_metrics))
        .route("/health", get(handlers::health_check))
        // WebSocket 路由
        .route("/ws", get(websocket::handle_websocket))
        .with_state(app_state);

    Router::new().nest("/api/v1", api_routes).layer(middleware)
}

/// 启动控制面服务，`shutdown` 完成后停止接收新连接
pub async fn serve<F>(config: &ServerConfig, app_state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("无法监听地址: {}", addr))?;

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);

    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("服务器错误")?;
    Ok(())
}
