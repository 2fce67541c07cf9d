// 引擎共享上下文
//
// 协调器与各任务的分片调度器共享同一份上下文：
// 运行时配置、事件总线、网络监测、性能优化器、上传协议，
// 以及调度器向协调器回报的通知 channel。

use super::retry::RetryPolicy;
use crate::config::{ChunkConfig, QueueConfig, RetryConfig};
use crate::error::UploadError;
use crate::events::EventBus;
use crate::network::{recommended_concurrency, NetworkMonitor};
use crate::optimizer::PerformanceOptimizer;
use crate::transport::UploadTransport;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 调度器回报给协调器的通知
#[derive(Debug)]
pub(crate) enum EngineNotice {
    /// 任务进入终态，释放活跃槽位
    TaskFinished {
        task_id: String,
        outcome: TaskOutcome,
    },
}

/// 任务最终结果
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskOutcome {
    Completed,
    Failed(UploadError),
    Cancelled,
}

pub(crate) struct EngineContext {
    pub config: RwLock<QueueConfig>,
    pub chunk: ChunkConfig,
    pub retry: RetryConfig,
    pub transport: Arc<dyn UploadTransport>,
    pub bus: EventBus,
    pub monitor: NetworkMonitor,
    pub optimizer: PerformanceOptimizer,
    pub notices: mpsc::UnboundedSender<EngineNotice>,
}

impl EngineContext {
    /// 当前允许的最大活跃任务数
    ///
    /// 取队列配置、优化器最优并发（启用自适应时）、网络建议（启用网络优化时）三者的最小值
    pub fn file_limit(&self) -> usize {
        let config = self.config.read();
        let mut limit = config.max_concurrent_files;
        if config.adaptive_optimization {
            limit = limit.min(self.optimizer.optimal_concurrency());
        }
        if config.network_optimization {
            limit = limit.min(recommended_concurrency(&self.monitor.metrics()).files);
        }
        limit.max(1)
    }

    /// 单个任务当前允许的最大并发分片数
    pub fn chunk_limit(&self) -> usize {
        let config = self.config.read();
        let mut limit = config.max_concurrent_chunks;
        if config.network_optimization {
            limit = limit.min(recommended_concurrency(&self.monitor.metrics()).chunks);
        }
        limit.max(1)
    }

    /// 新分片使用的分片大小
    pub fn chunk_size(&self) -> u64 {
        let config = self.config.read();
        if config.adaptive_optimization || config.network_optimization {
            self.optimizer.chunk_size()
        } else {
            self.chunk.default_chunk_size
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config.read(), &self.retry)
    }

    pub fn operation_timeout(&self) -> Duration {
        self.retry.operation_timeout()
    }
}
