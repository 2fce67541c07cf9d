// 上传事件类型定义

use crate::error::ErrorKind;
use crate::network::{EffectiveType, NetworkMetrics};
use crate::optimizer::PerformanceMetrics;
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    Low,
    Medium,
    High,
}

/// 事件类别（订阅时使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    UploadQueued,
    UploadStarted,
    UploadProgress,
    UploadCompleted,
    UploadError,
    UploadPaused,
    UploadResumed,
    UploadCancelled,
    QueueEmpty,
    PerformanceUpdate,
    NetworkChange,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::UploadQueued,
        EventKind::UploadStarted,
        EventKind::UploadProgress,
        EventKind::UploadCompleted,
        EventKind::UploadError,
        EventKind::UploadPaused,
        EventKind::UploadResumed,
        EventKind::UploadCancelled,
        EventKind::QueueEmpty,
        EventKind::PerformanceUpdate,
        EventKind::NetworkChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UploadQueued => "upload-queued",
            EventKind::UploadStarted => "upload-started",
            EventKind::UploadProgress => "upload-progress",
            EventKind::UploadCompleted => "upload-completed",
            EventKind::UploadError => "upload-error",
            EventKind::UploadPaused => "upload-paused",
            EventKind::UploadResumed => "upload-resumed",
            EventKind::UploadCancelled => "upload-cancelled",
            EventKind::QueueEmpty => "queue-empty",
            EventKind::PerformanceUpdate => "performance-update",
            EventKind::NetworkChange => "network-change",
        }
    }

    /// 从字符串解析（用于 WebSocket 订阅过滤）
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == s)
    }
}

/// 上传引擎事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UploadEvent {
    /// 任务入队
    UploadQueued {
        task_id: String,
        total_size: u64,
        priority: i32,
        /// 入队后在等待队列中的位置
        position: usize,
    },
    /// 任务晋升为活跃任务
    UploadStarted {
        task_id: String,
        total_size: u64,
        chunk_size: u64,
        /// 按当前分片大小估算的分片总数
        total_chunks: usize,
    },
    /// 分片提交后的进度更新
    UploadProgress {
        task_id: String,
        uploaded_bytes: u64,
        total_bytes: u64,
        /// 进度百分比 (0.0 - 100.0)
        percent: f64,
        /// 速度（字节/秒）
        speed: f64,
        /// 预计剩余时间（秒）
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eta_secs: Option<f64>,
        completed_chunks: usize,
        total_chunks: usize,
    },
    /// 任务完成
    UploadCompleted {
        task_id: String,
        upload_id: String,
        total_bytes: u64,
        duration_ms: u64,
        retry_count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },
    /// 任务失败（每个任务最多一次）
    UploadError {
        task_id: String,
        kind: ErrorKind,
        message: String,
        retry_count: u32,
    },
    UploadPaused {
        task_id: String,
    },
    UploadResumed {
        task_id: String,
        resume_count: u32,
    },
    UploadCancelled {
        task_id: String,
    },
    /// 队列中没有等待或活跃的任务
    QueueEmpty,
    /// 优化器周期输出
    PerformanceUpdate {
        metrics: PerformanceMetrics,
    },
    /// 网络状况变化
    NetworkChange {
        metrics: NetworkMetrics,
        previous_type: EffectiveType,
    },
}

impl UploadEvent {
    /// 事件类别
    pub fn kind(&self) -> EventKind {
        match self {
            UploadEvent::UploadQueued { .. } => EventKind::UploadQueued,
            UploadEvent::UploadStarted { .. } => EventKind::UploadStarted,
            UploadEvent::UploadProgress { .. } => EventKind::UploadProgress,
            UploadEvent::UploadCompleted { .. } => EventKind::UploadCompleted,
            UploadEvent::UploadError { .. } => EventKind::UploadError,
            UploadEvent::UploadPaused { .. } => EventKind::UploadPaused,
            UploadEvent::UploadResumed { .. } => EventKind::UploadResumed,
            UploadEvent::UploadCancelled { .. } => EventKind::UploadCancelled,
            UploadEvent::QueueEmpty => EventKind::QueueEmpty,
            UploadEvent::PerformanceUpdate { .. } => EventKind::PerformanceUpdate,
            UploadEvent::NetworkChange { .. } => EventKind::NetworkChange,
        }
    }

    /// 获取任务 ID（全局事件返回 None）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::UploadQueued { task_id, .. }
            | UploadEvent::UploadStarted { task_id, .. }
            | UploadEvent::UploadProgress { task_id, .. }
            | UploadEvent::UploadCompleted { task_id, .. }
            | UploadEvent::UploadError { task_id, .. }
            | UploadEvent::UploadPaused { task_id }
            | UploadEvent::UploadResumed { task_id, .. }
            | UploadEvent::UploadCancelled { task_id } => Some(task_id),
            UploadEvent::QueueEmpty
            | UploadEvent::PerformanceUpdate { .. }
            | UploadEvent::NetworkChange { .. } => None,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::UploadProgress { .. } | UploadEvent::PerformanceUpdate { .. } => {
                EventPriority::Low
            }
            UploadEvent::UploadStarted { .. } | UploadEvent::NetworkChange { .. } => {
                EventPriority::Medium
            }
            UploadEvent::UploadQueued { .. }
            | UploadEvent::UploadCompleted { .. }
            | UploadEvent::UploadError { .. }
            | UploadEvent::UploadPaused { .. }
            | UploadEvent::UploadResumed { .. }
            | UploadEvent::UploadCancelled { .. }
            | UploadEvent::QueueEmpty => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        self.kind().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = UploadEvent::UploadCancelled {
            task_id: "t-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "upload-cancelled");
        assert_eq!(json["task_id"], "t-1");

        let json = serde_json::to_value(UploadEvent::QueueEmpty).unwrap();
        assert_eq!(json["type"], "queue-empty");
    }

    #[test]
    fn test_error_event_carries_kind() {
        let event = UploadEvent::UploadError {
            task_id: "t-2".to_string(),
            kind: ErrorKind::Network,
            message: "connection reset".to_string(),
            retry_count: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "network");
        assert_eq!(event.kind(), EventKind::UploadError);
        assert_eq!(event.task_id(), Some("t-2"));
        assert_eq!(event.priority(), EventPriority::High);
    }

    #[test]
    fn test_kind_parse() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("download-started"), None);
    }
}
