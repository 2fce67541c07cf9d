// Video Upload Queue
// 视频分片上传队列引擎核心库

// 错误类型
pub mod error;

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 事件总线
pub mod events;

// 网络状况监测
pub mod network;

// 自适应性能优化器
pub mod optimizer;

// 分片上传协议
pub mod transport;

// 上传引擎模块
pub mod uploader;

// Web服务器模块（控制面）
pub mod server;

// 导出常用类型
pub use config::{EngineConfig, PriorityMode, QueueConfig, QueueConfigPatch};
pub use error::{ErrorKind, UploadError, UploadResult};
pub use events::{EventBus, EventKind, EventPriority, Subscription, UploadEvent};
pub use network::{EffectiveType, NetworkMetrics, NetworkMonitor, NetworkSampler};
pub use optimizer::{PerformanceMetrics, PerformanceOptimizer};
pub use server::AppState;
pub use transport::{HttpTransport, InMemoryTransport, UploadTransport};
pub use uploader::{
    CoordinatorBuilder, FilePayload, MemoryPayload, Payload, PayloadHandle, QueueCoordinator,
    QueueStatus, SessionContext, SubmitRequest, TaskSnapshot, UploadStatus,
};
