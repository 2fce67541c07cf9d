// 上传任务定义
//
// QueuedTask 是等待队列中的任务，晋升后转换为 UploadTask（活跃任务）。
// UploadTask 的状态只能通过 mark_* 方法按合法路径迁移：
//
//   initializing ─┬─> uploading ─┬─> completing ──> completed
//                 │              │
//                 └──> paused <──┘
//
// 任意非终态都可以进入 error / cancelled，终态不可再迁移。

use super::chunk::CompletedChunk;
use super::payload::PayloadHandle;
use crate::error::{ErrorKind, UploadError};
use crate::transport::FinalizeResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中（仍在队列）
    Queued,
    /// 初始化远端上传会话
    Initializing,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 合并分片中
    Completing,
    /// 已完成
    Completed,
    /// 失败
    Error,
    /// 已取消
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Error | UploadStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Initializing => "initializing",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completing => "completing",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        }
    }
}

/// 调用方会话信息，原样透传给上传协议
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// 进度信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    pub speed: f64,
    pub eta_secs: Option<f64>,
    pub completed_chunks: usize,
    pub total_chunks: usize,
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&FinalizeResult) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&UploadError) + Send + Sync>;

/// 单个任务的回调（与事件总线并行触发）
#[derive(Clone, Default)]
pub struct TaskCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl TaskCallbacks {
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&FinalizeResult) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&UploadError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TaskCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// 队列中的任务
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: String,
    pub payload: PayloadHandle,
    pub session: SessionContext,
    /// 数值越小越优先
    pub priority: i32,
    /// 入队时间（毫秒时间戳）
    pub enqueue_time: i64,
    /// 入队序号，同一毫秒内保证先后顺序
    pub sequence: u64,
    /// 暂停的排队任务不会被晋升
    pub paused: bool,
    pub callbacks: TaskCallbacks,
}

impl QueuedTask {
    pub fn total_size(&self) -> u64 {
        self.payload.size()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            name: self.payload.name().map(|n| n.to_string()),
            status: if self.paused {
                UploadStatus::Paused
            } else {
                UploadStatus::Queued
            },
            priority: self.priority,
            total_size: self.total_size(),
            uploaded_bytes: 0,
            progress: 0.0,
            speed: 0.0,
            total_chunks: 0,
            completed_chunks: 0,
            chunk_size: 0,
            retry_count: 0,
            resume_count: 0,
            remote_upload_id: None,
            error: None,
            error_kind: None,
            enqueue_time: self.enqueue_time,
            start_time: None,
            paused_at: None,
            completed_at: None,
        }
    }
}

/// 活跃上传任务
#[derive(Debug)]
pub struct UploadTask {
    pub id: String,
    pub payload: PayloadHandle,
    pub session: SessionContext,
    pub priority: i32,
    pub enqueue_time: i64,
    /// 远端上传会话 ID
    pub remote_upload_id: Option<String>,
    pub total_size: u64,
    /// 分片总数（分片大小变化时重新估算）
    pub total_chunks: usize,
    /// 最近一次创建的分片索引
    pub current_chunk_index: usize,
    /// 当前分片大小
    pub chunk_size: u64,
    pub uploaded_bytes: u64,
    /// 上传速度 (bytes/s)
    pub speed: f64,
    pub status: UploadStatus,
    pub error: Option<UploadError>,
    /// 所有分片累计的重试次数
    pub retry_count: u32,
    pub resume_count: u32,
    pub cancel_token: CancellationToken,
    pub callbacks: TaskCallbacks,
    /// 开始时间（毫秒时间戳）
    pub start_time: i64,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_progress_time: Instant,
    started: Instant,
    /// 暂停前的状态，恢复时回到该状态
    resume_status: UploadStatus,
    completed_chunks: BTreeMap<usize, CompletedChunk>,
}

impl UploadTask {
    /// 由队列任务晋升
    pub fn from_queued(queued: QueuedTask, chunk_size: u64) -> Self {
        let total_size = queued.total_size();
        let now = Instant::now();
        Self {
            id: queued.id,
            payload: queued.payload,
            session: queued.session,
            priority: queued.priority,
            enqueue_time: queued.enqueue_time,
            remote_upload_id: None,
            total_size,
            total_chunks: super::chunk::estimate_chunk_count(total_size, chunk_size),
            current_chunk_index: 0,
            chunk_size,
            uploaded_bytes: 0,
            speed: 0.0,
            status: UploadStatus::Initializing,
            error: None,
            retry_count: 0,
            resume_count: 0,
            cancel_token: CancellationToken::new(),
            callbacks: queued.callbacks,
            start_time: chrono::Utc::now().timestamp_millis(),
            paused_at: None,
            completed_at: None,
            last_progress_time: now,
            started: now,
            resume_status: UploadStatus::Initializing,
            completed_chunks: BTreeMap::new(),
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_bytes as f64 / self.total_size as f64) * 100.0
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<f64> {
        if self.speed <= 0.0 || self.uploaded_bytes >= self.total_size {
            return None;
        }
        Some((self.total_size - self.uploaded_bytes) as f64 / self.speed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_paused(&self) -> bool {
        self.status == UploadStatus::Paused
    }

    /// 任务运行时长
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn completed_chunk_count(&self) -> usize {
        self.completed_chunks.len()
    }

    /// 按索引排序的已完成分片
    pub fn completed_chunk_list(&self) -> Vec<CompletedChunk> {
        self.completed_chunks.values().cloned().collect()
    }

    /// 记录一个已完成的分片
    ///
    /// 重复提交或索引越界返回 false，已上传字节数只在首次提交时累加
    pub fn record_chunk(&mut self, chunk: CompletedChunk) -> bool {
        if chunk.index >= self.total_chunks || self.completed_chunks.contains_key(&chunk.index) {
            return false;
        }
        self.uploaded_bytes += chunk.size;
        self.completed_chunks.insert(chunk.index, chunk);
        true
    }

    /// 已完成分片是否恰好覆盖 0..total_chunks
    pub fn covers_all_chunks(&self) -> bool {
        if self.completed_chunks.len() != self.total_chunks {
            return false;
        }
        match (
            self.completed_chunks.keys().next(),
            self.completed_chunks.keys().next_back(),
        ) {
            (Some(first), Some(last)) => *first == 0 && *last + 1 == self.total_chunks,
            _ => self.total_chunks == 0,
        }
    }

    /// 根据最新提交的分片更新速度
    pub fn update_speed(&mut self, bytes: u64) {
        let now = Instant::now();
        let secs = now.duration_since(self.last_progress_time).as_secs_f64();
        if secs > 0.0 {
            self.speed = bytes as f64 / secs;
        }
        self.last_progress_time = now;
    }

    pub fn progress_update(&self) -> ProgressUpdate {
        ProgressUpdate {
            uploaded_bytes: self.uploaded_bytes,
            total_bytes: self.total_size,
            percent: self.progress(),
            speed: self.speed,
            eta_secs: self.eta(),
            completed_chunks: self.completed_chunks.len(),
            total_chunks: self.total_chunks,
        }
    }

    /// 检查状态迁移是否合法
    pub fn can_transition(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self.status, next) {
            (Initializing, Uploading | Paused) => true,
            (Uploading, Paused | Completing) => true,
            (Paused, Initializing | Uploading) => true,
            (Completing, Completed) => true,
            (from, Error | Cancelled) => !from.is_terminal() && from != Queued,
            _ => false,
        }
    }

    /// 远端会话已建立
    ///
    /// 暂停中建立的会话在恢复后直接进入上传阶段
    pub fn mark_uploading(&mut self, upload_id: String) -> bool {
        self.remote_upload_id = Some(upload_id);
        match self.status {
            UploadStatus::Initializing => {
                self.status = UploadStatus::Uploading;
                true
            }
            UploadStatus::Paused => {
                self.resume_status = UploadStatus::Uploading;
                true
            }
            _ => false,
        }
    }

    pub fn mark_paused(&mut self) -> bool {
        if !self.can_transition(UploadStatus::Paused) {
            return false;
        }
        self.resume_status = self.status;
        self.status = UploadStatus::Paused;
        self.paused_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    pub fn mark_resumed(&mut self) -> bool {
        if self.status != UploadStatus::Paused {
            return false;
        }
        self.status = self.resume_status;
        self.paused_at = None;
        self.resume_count += 1;
        // 暂停期间不计入速度
        self.last_progress_time = Instant::now();
        true
    }

    pub fn mark_completing(&mut self) -> bool {
        if !self.can_transition(UploadStatus::Completing) {
            return false;
        }
        self.status = UploadStatus::Completing;
        true
    }

    pub fn mark_completed(&mut self) -> bool {
        if !self.can_transition(UploadStatus::Completed) {
            return false;
        }
        self.status = UploadStatus::Completed;
        self.speed = 0.0;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    pub fn mark_failed(&mut self, error: UploadError) -> bool {
        if !self.can_transition(UploadStatus::Error) {
            return false;
        }
        self.status = UploadStatus::Error;
        self.error = Some(error);
        self.speed = 0.0;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    pub fn mark_cancelled(&mut self) -> bool {
        if !self.can_transition(UploadStatus::Cancelled) {
            return false;
        }
        self.status = UploadStatus::Cancelled;
        self.speed = 0.0;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        true
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            name: self.payload.name().map(|n| n.to_string()),
            status: self.status,
            priority: self.priority,
            total_size: self.total_size,
            uploaded_bytes: self.uploaded_bytes,
            progress: self.progress(),
            speed: self.speed,
            total_chunks: self.total_chunks,
            completed_chunks: self.completed_chunks.len(),
            chunk_size: self.chunk_size,
            retry_count: self.retry_count,
            resume_count: self.resume_count,
            remote_upload_id: self.remote_upload_id.clone(),
            error: self.error.as_ref().map(|e| e.to_string()),
            error_kind: self.error.as_ref().map(|e| e.kind()),
            enqueue_time: self.enqueue_time,
            start_time: Some(self.start_time),
            paused_at: self.paused_at,
            completed_at: self.completed_at,
        }
    }
}

/// 任务只读快照（查询接口和控制面返回）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: UploadStatus,
    pub priority: i32,
    pub total_size: u64,
    pub uploaded_bytes: u64,
    pub progress: f64,
    pub speed: f64,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub chunk_size: u64,
    pub retry_count: u32,
    pub resume_count: u32,
    pub remote_upload_id: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub enqueue_time: i64,
    pub start_time: Option<i64>,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::payload::MemoryPayload;

    fn queued(size: usize) -> QueuedTask {
        QueuedTask {
            id: "task-1".to_string(),
            payload: Arc::new(MemoryPayload::named("a.mp4", vec![0; size])),
            session: SessionContext::new("s-1"),
            priority: 0,
            enqueue_time: 0,
            sequence: 0,
            paused: false,
            callbacks: TaskCallbacks::default(),
        }
    }

    fn chunk(index: usize, size: u64) -> CompletedChunk {
        CompletedChunk {
            index,
            checksum: format!("etag-{}", index),
            size,
        }
    }

    #[test]
    fn test_task_creation() {
        let task = UploadTask::from_queued(queued(1000), 300);
        assert_eq!(task.status, UploadStatus::Initializing);
        assert_eq!(task.total_size, 1000);
        assert_eq!(task.total_chunks, 4);
        assert_eq!(task.uploaded_bytes, 0);
        assert_eq!(task.retry_count, 0);
        assert!(!task.cancel_token.is_cancelled());
    }

    #[test]
    fn test_progress_and_eta() {
        let mut task = UploadTask::from_queued(queued(1000), 250);
        assert!(task.record_chunk(chunk(0, 250)));
        assert!((task.progress() - 25.0).abs() < 1e-9);

        task.speed = 250.0;
        assert_eq!(task.eta(), Some(3.0));
    }

    #[test]
    fn test_record_chunk_rejects_duplicates() {
        let mut task = UploadTask::from_queued(queued(1000), 500);
        assert!(task.record_chunk(chunk(1, 500)));
        assert!(!task.record_chunk(chunk(1, 500)));
        assert!(!task.record_chunk(chunk(2, 500)));
        assert_eq!(task.uploaded_bytes, 500);
        assert!(!task.covers_all_chunks());

        assert!(task.record_chunk(chunk(0, 500)));
        assert!(task.covers_all_chunks());
        let indices: Vec<usize> = task.completed_chunk_list().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = UploadTask::from_queued(queued(10), 10);
        assert!(!task.mark_completing());
        assert!(task.mark_uploading("up-1".to_string()));
        assert_eq!(task.status, UploadStatus::Uploading);

        assert!(task.mark_paused());
        assert!(task.paused_at.is_some());
        assert!(!task.mark_paused());
        assert!(task.mark_resumed());
        assert_eq!(task.status, UploadStatus::Uploading);
        assert_eq!(task.resume_count, 1);

        assert!(task.mark_completing());
        assert!(task.mark_completed());
        assert!(task.is_terminal());

        // 终态不可再迁移
        assert!(!task.mark_cancelled());
        assert!(!task.mark_failed(UploadError::Network("late".into())));
        assert_eq!(task.status, UploadStatus::Completed);
    }

    #[test]
    fn test_pause_during_initialization() {
        let mut task = UploadTask::from_queued(queued(10), 10);
        assert!(task.mark_paused());
        // 暂停期间远端会话建立
        assert!(task.mark_uploading("up-1".to_string()));
        assert_eq!(task.status, UploadStatus::Paused);
        assert!(task.mark_resumed());
        assert_eq!(task.status, UploadStatus::Uploading);
    }

    #[test]
    fn test_cancel_and_error_are_final() {
        let mut task = UploadTask::from_queued(queued(10), 10);
        assert!(task.mark_cancelled());
        assert!(!task.mark_failed(UploadError::Network("x".into())));
        assert!(!task.mark_resumed());
        assert_eq!(task.status, UploadStatus::Cancelled);

        let mut task = UploadTask::from_queued(queued(10), 10);
        assert!(task.mark_paused());
        assert!(task.mark_failed(UploadError::from_status(403, "denied", None)));
        assert_eq!(task.snapshot().error_kind, Some(ErrorKind::Client));
    }

    #[test]
    fn test_queued_snapshot() {
        let mut q = queued(42);
        assert_eq!(q.snapshot().status, UploadStatus::Queued);
        q.paused = true;
        let snap = q.snapshot();
        assert_eq!(snap.status, UploadStatus::Paused);
        assert_eq!(snap.total_size, 42);
        assert_eq!(snap.name.as_deref(), Some("a.mp4"));
    }
}
