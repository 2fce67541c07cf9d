// 应用状态

use crate::config::EngineConfig;
use crate::uploader::QueueCoordinator;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// 控制面全局状态
#[derive(Clone)]
pub struct AppState {
    /// 上传队列协调器
    pub coordinator: QueueCoordinator,
    /// 引擎配置（队列部分随 PUT /config 更新）
    pub config: Arc<RwLock<EngineConfig>>,
    /// 配置文件路径，为 None 时不写回磁盘
    pub config_path: Option<Arc<str>>,
    /// 服务启动时间
    pub started_at: Instant,
}

impl AppState {
    /// 创建新的应用状态
    pub fn new(coordinator: QueueCoordinator, config: EngineConfig) -> Self {
        Self {
            coordinator,
            config: Arc::new(RwLock::new(config)),
            config_path: None,
            started_at: Instant::now(),
        }
    }

    /// 配置修改后写回指定文件
    pub fn with_config_path(mut self, path: impl Into<Arc<str>>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}
