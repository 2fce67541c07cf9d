use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use video_upload_queue::{
    config::{LogConfig, TransportConfig, TransportKind},
    events::{EventKind, EventPriority, UploadEvent},
    logging, server, AppState, EngineConfig, FilePayload, HttpTransport, InMemoryTransport,
    QueueCoordinator, SessionContext, UploadTransport,
};

/// 配置文件路径环境变量
const CONFIG_ENV: &str = "UPLOAD_QUEUE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/engine.toml";
/// 命令行提交任务时使用的会话 ID 环境变量
const SESSION_ENV: &str = "UPLOAD_QUEUE_SESSION";

/// 加载日志配置
///
/// 日志系统初始化之前只读取 [log] 段，失败时返回默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

/// 按配置创建上传协议实现
fn build_transport(config: &TransportConfig) -> Result<Arc<dyn UploadTransport>> {
    let transport: Arc<dyn UploadTransport> = match config.kind {
        TransportKind::Http => {
            info!("使用 HTTP 分片上传协议: {}", config.base_url);
            Arc::new(HttpTransport::new(config).context("创建 HTTP 上传客户端失败")?)
        }
        TransportKind::Memory => {
            info!("使用进程内上传存储");
            Arc::new(InMemoryTransport::new())
        }
    };
    Ok(transport)
}

/// 按事件优先级输出日志
fn log_event(event: &UploadEvent) {
    let json = serde_json::to_string(event).unwrap_or_default();
    match (event, event.priority()) {
        (UploadEvent::UploadError { .. }, _) => warn!("[事件] {}", json),
        (_, EventPriority::High) => info!("[事件] {}", json),
        (_, EventPriority::Medium) => debug!("[事件] {}", json),
        (_, EventPriority::Low) => tracing::trace!("[事件] {}", json),
    }
}

/// 提交命令行传入的文件，返回成功提交的数量
async fn submit_files(coordinator: &QueueCoordinator, paths: &[String]) -> usize {
    let session_id = std::env::var(SESSION_ENV).unwrap_or_else(|_| "cli".to_string());
    let mut submitted = 0;

    for path in paths {
        let payload = match FilePayload::open(path).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("跳过无法读取的文件 {}: {:#}", path, e);
                continue;
            }
        };
        match coordinator.submit(Arc::new(payload), SessionContext::new(&session_id), None) {
            Ok(task_id) => {
                info!("📤 已提交上传任务: {} -> {}", path, task_id);
                submitted += 1;
            }
            Err(e) => warn!("提交上传任务失败 {}: {}", path, e),
        }
    }

    submitted
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听 Ctrl+C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到 Ctrl+C，开始优雅关闭...");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    // 先加载日志配置（必须保持 _log_guard 存活）
    let log_config = load_log_config(&config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Video Upload Queue v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load_or_default(&config_path).await;
    let transport = build_transport(&config.transport)?;
    let coordinator = QueueCoordinator::builder(transport)
        .engine_config(&config)
        .build()
        .context("创建上传队列失败")?;

    let log_subscription = coordinator.subscribe_all(log_event);
    // 在提交之前订阅，避免错过 queue-empty
    let (queue_empty_subscription, mut queue_empty) =
        coordinator.subscribe_channel(Some(EventKind::QueueEmpty));

    let files: Vec<String> = std::env::args().skip(1).collect();
    let submitted = submit_files(&coordinator, &files).await;

    if config.server.enabled {
        let app_state = AppState::new(coordinator.clone(), config.clone())
            .with_config_path(config_path.as_str());
        server::serve(&config.server, app_state, shutdown_signal()).await?;
    } else if submitted > 0 {
        info!("控制面未启用，等待 {} 个任务完成", submitted);
        let wait_drained = async {
            // 提交过程中可能已经触发过 queue-empty，以实际状态为准
            while queue_empty.recv().await.is_some() {
                let status = coordinator.get_status().await;
                if status.queued + status.active == 0 {
                    break;
                }
            }
        };
        tokio::select! {
            _ = wait_drained => {
                info!("✅ 全部上传任务已结束");
            }
            _ = shutdown_signal() => {}
        }
    } else {
        info!("没有待上传的文件且控制面未启用，退出");
    }

    queue_empty_subscription.unsubscribe();
    log_subscription.unsubscribe();

    let status = coordinator.get_status().await;
    info!(
        "队列统计: 完成={}, 失败={}, 取消={}",
        status.completed, status.failed, status.cancelled
    );

    coordinator.shutdown().await;
    info!("应用已安全退出");
    Ok(())
}
