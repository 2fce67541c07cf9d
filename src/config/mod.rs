// 配置管理模块

use crate::error::UploadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认最小分片大小：256KB
pub const DEFAULT_MIN_CHUNK_SIZE: u64 = 256 * 1024;
/// 默认分片大小：5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// 默认最大分片大小：10MB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// 引擎配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 队列配置（运行时可修改）
    #[serde(default)]
    pub queue: QueueConfig,
    /// 分片大小配置
    #[serde(default)]
    pub chunk: ChunkConfig,
    /// 网络监测配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 性能优化器配置
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 上传协议配置
    #[serde(default)]
    pub transport: TransportConfig,
    /// 控制面服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

// =====================================================
// 队列配置
// =====================================================

/// 队列优先级模式
///
/// 优先级相同时的二级排序规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityMode {
    /// 先进先出
    #[default]
    Fifo,
    /// 小文件优先
    SmallestFirst,
    /// 大文件优先
    LargestFirst,
}

/// 队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 单个操作的最大重试次数
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// 优先级模式
    #[serde(default)]
    pub priority_mode: PriorityMode,
    /// 是否启用自适应并发/分片调整
    #[serde(default = "default_true")]
    pub adaptive_optimization: bool,
    /// 是否根据网络状况调整并发与分片
    #[serde(default = "default_true")]
    pub network_optimization: bool,
}

fn default_max_concurrent_files() -> usize {
    3
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            retry_attempts: default_retry_attempts(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            priority_mode: PriorityMode::default(),
            adaptive_optimization: true,
            network_optimization: true,
        }
    }
}

impl QueueConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.max_concurrent_files == 0 {
            return Err(UploadError::Validation(
                "max_concurrent_files 必须大于 0".to_string(),
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(UploadError::Validation(
                "max_concurrent_chunks 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 应用部分更新
    ///
    /// 校验失败时配置保持不变
    pub fn apply(&mut self, patch: &QueueConfigPatch) -> Result<(), UploadError> {
        let mut next = self.clone();
        if let Some(v) = patch.max_concurrent_files {
            next.max_concurrent_files = v;
        }
        if let Some(v) = patch.max_concurrent_chunks {
            next.max_concurrent_chunks = v;
        }
        if let Some(v) = patch.retry_attempts {
            next.retry_attempts = v;
        }
        if let Some(v) = patch.base_retry_delay_ms {
            next.base_retry_delay_ms = v;
        }
        if let Some(v) = patch.priority_mode {
            next.priority_mode = v;
        }
        if let Some(v) = patch.adaptive_optimization {
            next.adaptive_optimization = v;
        }
        if let Some(v) = patch.network_optimization {
            next.network_optimization = v;
        }

        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// 队列配置的部分更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfigPatch {
    #[serde(default)]
    pub max_concurrent_files: Option<usize>,
    #[serde(default)]
    pub max_concurrent_chunks: Option<usize>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    #[serde(default)]
    pub base_retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub priority_mode: Option<PriorityMode>,
    #[serde(default)]
    pub adaptive_optimization: Option<bool>,
    #[serde(default)]
    pub network_optimization: Option<bool>,
}

// =====================================================
// 分片配置
// =====================================================

/// 分片大小配置（字节）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

fn default_min_chunk_size() -> u64 {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_max_chunk_size() -> u64 {
    DEFAULT_MAX_CHUNK_SIZE
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

impl ChunkConfig {
    /// 将分片大小限制在 [min, max] 区间内
    pub fn clamp(&self, size: u64) -> u64 {
        size.max(self.min_chunk_size).min(self.max_chunk_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 {
            anyhow::bail!("min_chunk_size 必须大于 0");
        }
        if self.min_chunk_size > self.max_chunk_size {
            anyhow::bail!(
                "min_chunk_size ({}) 不能大于 max_chunk_size ({})",
                self.min_chunk_size,
                self.max_chunk_size
            );
        }
        if self.default_chunk_size < self.min_chunk_size
            || self.default_chunk_size > self.max_chunk_size
        {
            anyhow::bail!(
                "default_chunk_size ({}) 必须位于 [{}, {}] 区间内",
                self.default_chunk_size,
                self.min_chunk_size,
                self.max_chunk_size
            );
        }
        Ok(())
    }
}

// =====================================================
// 网络监测配置
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 采样间隔（毫秒）
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// 速度 EMA 权重
    #[serde(default = "default_speed_ema_weight")]
    pub speed_ema_weight: f64,
    /// 原始速度样本环形缓冲区容量
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// 速度变化超过该比例视为网络变化（0.2 = 20%）
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
}

fn default_sample_interval_ms() -> u64 {
    5000
}

fn default_speed_ema_weight() -> f64 {
    0.3
}

fn default_sample_capacity() -> usize {
    10
}

fn default_change_threshold() -> f64 {
    0.2
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            speed_ema_weight: default_speed_ema_weight(),
            sample_capacity: default_sample_capacity(),
            change_threshold: default_change_threshold(),
        }
    }
}

impl NetworkConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

// =====================================================
// 性能优化器配置
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// 成功率滑动窗口大小（按最近完成的任务数）
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// 成功率低于该值时降低并发
    #[serde(default = "default_low_success_rate")]
    pub low_success_rate: f64,
    /// 成功率高于该值且速度不足时提升并发
    #[serde(default = "default_high_success_rate")]
    pub high_success_rate: f64,
    /// 实测速度 / 期望速度 低于该值时缩小分片
    #[serde(default = "default_slow_speed_ratio")]
    pub slow_speed_ratio: f64,
    /// 实测速度 / 期望速度 高于该值时增大分片
    #[serde(default = "default_fast_speed_ratio")]
    pub fast_speed_ratio: f64,
    /// 分片缩小系数
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,
    /// 分片增大系数
    #[serde(default = "default_grow_factor")]
    pub grow_factor: f64,
    /// 优化器允许的最大并发文件数
    #[serde(default = "default_optimizer_max_concurrency")]
    pub max_concurrency: usize,
    /// 调整周期（毫秒）
    #[serde(default = "default_adjust_interval_ms")]
    pub adjust_interval_ms: u64,
    /// 平均速度 EMA 权重
    #[serde(default = "default_speed_ema_weight")]
    pub speed_ema_weight: f64,
}

fn default_window_size() -> usize {
    20
}

fn default_low_success_rate() -> f64 {
    0.8
}

fn default_high_success_rate() -> f64 {
    0.95
}

fn default_slow_speed_ratio() -> f64 {
    0.7
}

fn default_fast_speed_ratio() -> f64 {
    1.2
}

fn default_shrink_factor() -> f64 {
    0.8
}

fn default_grow_factor() -> f64 {
    1.2
}

fn default_optimizer_max_concurrency() -> usize {
    5
}

fn default_adjust_interval_ms() -> u64 {
    10_000
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            low_success_rate: default_low_success_rate(),
            high_success_rate: default_high_success_rate(),
            slow_speed_ratio: default_slow_speed_ratio(),
            fast_speed_ratio: default_fast_speed_ratio(),
            shrink_factor: default_shrink_factor(),
            grow_factor: default_grow_factor(),
            max_concurrency: default_optimizer_max_concurrency(),
            adjust_interval_ms: default_adjust_interval_ms(),
            speed_ema_weight: default_speed_ema_weight(),
        }
    }
}

impl OptimizerConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            anyhow::bail!("window_size 必须大于 0");
        }
        if self.low_success_rate > self.high_success_rate {
            anyhow::bail!(
                "low_success_rate ({}) 不能大于 high_success_rate ({})",
                self.low_success_rate,
                self.high_success_rate
            );
        }
        if self.slow_speed_ratio > self.fast_speed_ratio {
            anyhow::bail!(
                "slow_speed_ratio ({}) 不能大于 fast_speed_ratio ({})",
                self.slow_speed_ratio,
                self.fast_speed_ratio
            );
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor <= 1.0) {
            anyhow::bail!("shrink_factor 必须位于 (0, 1] 区间内: {}", self.shrink_factor);
        }
        if !(self.grow_factor >= 1.0) {
            anyhow::bail!("grow_factor 不能小于 1: {}", self.grow_factor);
        }
        Ok(())
    }
}

// =====================================================
// 重试配置
// =====================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 抖动比例（0.2 = ±20%）
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// 单次操作超时（毫秒）
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_operation_timeout_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl RetryConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }
}

// =====================================================
// 上传协议配置
// =====================================================

/// 上传协议实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// REST 分片上传协议
    #[default]
    Http,
    /// 进程内存储（演示、测试）
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    /// 上传服务根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer 令牌
    #[serde(default)]
    pub auth_token: Option<String>,
    /// HTTP 客户端连接超时（毫秒）
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            base_url: default_base_url(),
            auth_token: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// =====================================================
// 服务器与日志配置
// =====================================================

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 是否启动控制面服务
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 日志目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（trace/debug/info/warn/error），RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

// =====================================================
// 加载与保存
// =====================================================

impl EngineConfig {
    /// 校验整份配置
    pub fn validate(&self) -> Result<()> {
        self.queue.validate().context("队列配置无效")?;
        self.chunk.validate().context("分片配置无效")?;
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            anyhow::bail!("retry.jitter 必须位于 [0, 1] 区间内: {}", self.retry.jitter);
        }
        self.optimizer.validate().context("优化器配置无效")?;
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: EngineConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，失败时使用默认配置并尝试写回
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.max_concurrent_files, 3);
        assert_eq!(config.queue.max_concurrent_chunks, 4);
        assert_eq!(config.queue.retry_attempts, 3);
        assert_eq!(config.queue.base_retry_delay_ms, 1000);
        assert_eq!(config.queue.priority_mode, PriorityMode::Fifo);
        assert!(config.queue.adaptive_optimization);
        assert!(config.queue.network_optimization);

        assert_eq!(config.chunk.min_chunk_size, 256 * 1024);
        assert_eq!(config.chunk.default_chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.chunk.max_chunk_size, 10 * 1024 * 1024);

        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.optimizer.window_size, 20);
        assert_eq!(config.optimizer.max_concurrency, 5);
        assert_eq!(config.network.sample_interval_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[queue]
max_concurrent_files = 2
priority_mode = "smallest-first"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.max_concurrent_files, 2);
        assert_eq!(config.queue.priority_mode, PriorityMode::SmallestFirst);
        assert_eq!(config.queue.max_concurrent_chunks, 4);
        assert_eq!(config.chunk, ChunkConfig::default());
        assert_eq!(config.server.port, 18890);
    }

    #[test]
    fn test_patch_apply() {
        let mut config = QueueConfig::default();
        let patch = QueueConfigPatch {
            max_concurrent_files: Some(5),
            priority_mode: Some(PriorityMode::LargestFirst),
            ..Default::default()
        };
        config.apply(&patch).unwrap();
        assert_eq!(config.max_concurrent_files, 5);
        assert_eq!(config.priority_mode, PriorityMode::LargestFirst);
        assert_eq!(config.max_concurrent_chunks, 4);
    }

    #[test]
    fn test_patch_rejects_zero_limits() {
        let mut config = QueueConfig::default();
        let before = config.clone();

        let patch = QueueConfigPatch {
            max_concurrent_files: Some(6),
            max_concurrent_chunks: Some(0),
            ..Default::default()
        };
        let err = config.apply(&patch).unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        // 校验失败时不产生部分修改
        assert_eq!(config, before);
    }

    #[test]
    fn test_chunk_config_validation() {
        let mut chunk = ChunkConfig::default();
        assert!(chunk.validate().is_ok());
        assert_eq!(chunk.clamp(1), DEFAULT_MIN_CHUNK_SIZE);
        assert_eq!(chunk.clamp(u64::MAX), DEFAULT_MAX_CHUNK_SIZE);

        chunk.min_chunk_size = 20 * 1024 * 1024;
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn test_optimizer_thresholds_validated() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.optimizer.low_success_rate = 0.99;
        config.optimizer.high_success_rate = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.optimizer.slow_speed_ratio = 2.0;
        config.optimizer.fast_speed_ratio = 1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.optimizer.shrink_factor = 0.0;
        assert!(config.validate().is_err());
        config.optimizer.shrink_factor = 1.5;
        assert!(config.validate().is_err());
        config.optimizer.shrink_factor = 1.0;
        assert!(config.validate().is_ok());

        let mut config = EngineConfig::default();
        config.optimizer.grow_factor = 0.8;
        assert!(config.validate().is_err());
        config.optimizer.grow_factor = f64::NAN;
        assert!(config.validate().is_err());
        config.optimizer.grow_factor = 1.0;
        assert!(config.validate().is_ok());

        let mut config = EngineConfig::default();
        config.optimizer.window_size = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("engine.toml");
        let path = path.to_str().unwrap();

        let mut config = EngineConfig::default();
        config.queue.max_concurrent_files = 7;
        config.transport.kind = TransportKind::Memory;
        config.save_to_file(path).await.unwrap();

        let loaded = EngineConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let path = path.to_str().unwrap();

        let config = EngineConfig::load_or_default(path).await;
        assert_eq!(config, EngineConfig::default());
        assert!(std::path::Path::new(path).exists());
    }
}
