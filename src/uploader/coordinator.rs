// 上传队列协调器
//
// 进程级唯一入口，负责：
// - 接收上传请求，维护等待队列（按优先级排序）
// - 活跃槽位有空余时晋升任务并启动分片调度器
// - 暂停 / 恢复 / 取消
// - 运行时配置更新
// - 网络采样与性能优化的周期任务
//
// 晋升完全由事件驱动：提交、任务结束、配置变化、网络变化、优化调整时触发，没有轮询。
//
// 锁顺序：协调器状态锁（parking_lot）只做簿记，持有期间不 await、不发布事件；
// 单任务的事件在该任务的 tokio 锁内发布，保证同一任务的事件因果有序。

use super::context::{EngineContext, EngineNotice, TaskOutcome};
use super::payload::PayloadHandle;
use super::scheduler::ChunkScheduler;
use super::task::{QueuedTask, SessionContext, TaskCallbacks, TaskSnapshot, UploadStatus, UploadTask};
use crate::config::{
    ChunkConfig, EngineConfig, NetworkConfig, OptimizerConfig, PriorityMode, QueueConfig,
    QueueConfigPatch, RetryConfig,
};
use crate::error::{UploadError, UploadResult};
use crate::events::{EventBus, EventKind, Subscription, UploadEvent};
use crate::network::{recommended_chunk_size, NetworkChange, NetworkMetrics, NetworkMonitor, NetworkSampler};
use crate::optimizer::{PerformanceMetrics, PerformanceOptimizer};
use crate::transport::UploadTransport;
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 关闭时等待活跃任务退出的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// 保留的已结束任务快照上限，超出后淘汰最早结束的
const MAX_FINISHED_SNAPSHOTS: usize = 1000;

/// 上传请求
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub payload: PayloadHandle,
    pub session: SessionContext,
    /// 数值越小越优先，默认 0
    pub priority: Option<i32>,
    pub callbacks: TaskCallbacks,
}

impl SubmitRequest {
    pub fn new(payload: PayloadHandle, session: SessionContext) -> Self {
        Self {
            payload,
            session,
            priority: None,
            callbacks: TaskCallbacks::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_callbacks(mut self, callbacks: TaskCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// 队列状态统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// 等待晋升的任务（不含已暂停）
    pub queued: usize,
    /// 占用槽位的任务（含已暂停的活跃任务）
    pub active: usize,
    /// 已暂停的任务（排队中 + 活跃中）
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent_files: usize,
    /// 综合优化器与网络建议后的实际并发上限
    pub effective_file_limit: usize,
}

struct ActiveEntry {
    task: Arc<AsyncMutex<UploadTask>>,
    control: Arc<Notify>,
}

impl ActiveEntry {
    fn clone_handles(&self) -> (Arc<AsyncMutex<UploadTask>>, Arc<Notify>) {
        (self.task.clone(), self.control.clone())
    }
}

#[derive(Default)]
struct CoordinatorState {
    pending: Vec<QueuedTask>,
    active: HashMap<String, ActiveEntry>,
    finished: HashMap<String, TaskSnapshot>,
    /// 已结束任务的结束顺序，用于淘汰
    finished_order: VecDeque<String>,
    completed: usize,
    failed: usize,
    cancelled: usize,
    next_sequence: u64,
    closed: bool,
}

impl CoordinatorState {
    /// 按 (优先级, 模式排序键, 入队序号) 选出下一个可晋升的任务
    fn next_pending(&self, mode: PriorityMode) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, task)| !task.paused)
            .min_by_key(|(_, task)| {
                let size = task.total_size() as i128;
                let size_key = match mode {
                    PriorityMode::Fifo => 0,
                    PriorityMode::SmallestFirst => size,
                    PriorityMode::LargestFirst => -size,
                };
                (task.priority, size_key, task.sequence)
            })
            .map(|(index, _)| index)
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    fn record_finished(&mut self, snapshot: TaskSnapshot) {
        match snapshot.status {
            UploadStatus::Completed => self.completed += 1,
            UploadStatus::Error => self.failed += 1,
            _ => self.cancelled += 1,
        }
        let id = snapshot.id.clone();
        if self.finished.insert(id.clone(), snapshot).is_none() {
            self.finished_order.push_back(id);
        }
        while self.finished_order.len() > MAX_FINISHED_SNAPSHOTS {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    fn clear_finished(&mut self) -> usize {
        let removed = self.finished.len();
        self.finished.clear();
        self.finished_order.clear();
        removed
    }
}

/// 刚晋升、尚未发布 started 事件的任务
struct Promotion {
    task_id: String,
    guard: OwnedMutexGuard<UploadTask>,
    task: Arc<AsyncMutex<UploadTask>>,
    control: Arc<Notify>,
}

struct CoordinatorInner {
    ctx: Arc<EngineContext>,
    state: Mutex<CoordinatorState>,
    /// 停止后台周期任务
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// 上传队列协调器
#[derive(Clone)]
pub struct QueueCoordinator {
    inner: Arc<CoordinatorInner>,
}

// =====================================================
// 构建
// =====================================================

/// 协调器构建器
pub struct CoordinatorBuilder {
    transport: Arc<dyn UploadTransport>,
    queue: QueueConfig,
    chunk: ChunkConfig,
    network: NetworkConfig,
    optimizer: OptimizerConfig,
    retry: RetryConfig,
    sampler: Option<Arc<dyn NetworkSampler>>,
}

impl CoordinatorBuilder {
    pub fn new(transport: Arc<dyn UploadTransport>) -> Self {
        Self {
            transport,
            queue: QueueConfig::default(),
            chunk: ChunkConfig::default(),
            network: NetworkConfig::default(),
            optimizer: OptimizerConfig::default(),
            retry: RetryConfig::default(),
            sampler: None,
        }
    }

    /// 使用配置文件中的全部引擎配置
    pub fn engine_config(mut self, config: &EngineConfig) -> Self {
        self.queue = config.queue.clone();
        self.chunk = config.chunk.clone();
        self.network = config.network.clone();
        self.optimizer = config.optimizer.clone();
        self.retry = config.retry.clone();
        self
    }

    pub fn queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn chunk_config(mut self, chunk: ChunkConfig) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn network_config(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn optimizer_config(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// 平台网络采样器，未设置时只使用实测吞吐量
    pub fn network_sampler(mut self, sampler: Arc<dyn NetworkSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// 构建协调器并启动后台任务（必须在 tokio 运行时内调用）
    pub fn build(self) -> Result<QueueCoordinator> {
        self.queue.validate().context("队列配置无效")?;
        self.chunk.validate().context("分片配置无效")?;

        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(EngineContext {
            monitor: NetworkMonitor::new(self.network, self.sampler),
            optimizer: PerformanceOptimizer::new(self.optimizer, self.chunk.clone()),
            config: RwLock::new(self.queue),
            chunk: self.chunk,
            retry: self.retry,
            transport: self.transport,
            bus: EventBus::new(),
            notices: notices_tx,
        });

        let coordinator = QueueCoordinator {
            inner: Arc::new(CoordinatorInner {
                ctx,
                state: Mutex::new(CoordinatorState::default()),
                shutdown: CancellationToken::new(),
                background: Mutex::new(Vec::new()),
            }),
        };
        coordinator.spawn_background(notices_rx);

        info!("上传队列协调器已启动: {:?}", coordinator.config());
        Ok(coordinator)
    }
}

impl QueueCoordinator {
    pub fn builder(transport: Arc<dyn UploadTransport>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(transport)
    }

    fn ctx(&self) -> &Arc<EngineContext> {
        &self.inner.ctx
    }

    // =====================================================
    // 提交
    // =====================================================

    /// 提交单个上传任务，返回任务 ID
    pub fn submit(
        &self,
        payload: PayloadHandle,
        session: SessionContext,
        priority: Option<i32>,
    ) -> UploadResult<String> {
        let mut request = SubmitRequest::new(payload, session);
        request.priority = priority;
        self.submit_request(request)
    }

    pub fn submit_request(&self, request: SubmitRequest) -> UploadResult<String> {
        let mut ids = self.submit_batch(vec![request])?;
        ids.pop()
            .ok_or_else(|| UploadError::Validation("提交列表为空".to_string()))
    }

    /// 批量提交
    ///
    /// 全部校验通过后才入队，之后统一执行一次晋升，优先级排序覆盖整批任务
    pub fn submit_batch(&self, requests: Vec<SubmitRequest>) -> UploadResult<Vec<String>> {
        if requests.is_empty() {
            return Err(UploadError::Validation("提交列表为空".to_string()));
        }
        for request in &requests {
            validate_request(request)?;
        }

        let enqueue_time = chrono::Utc::now().timestamp_millis();
        let (base_sequence, base_position) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(UploadError::Validation("上传队列已关闭".to_string()));
            }
            let base = state.next_sequence;
            state.next_sequence += requests.len() as u64;
            (base, state.pending.len())
        };

        let tasks: Vec<QueuedTask> = requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| QueuedTask {
                id: Uuid::new_v4().to_string(),
                payload: request.payload,
                session: request.session,
                priority: request.priority.unwrap_or(0),
                enqueue_time,
                sequence: base_sequence + i as u64,
                paused: false,
                callbacks: request.callbacks,
            })
            .collect();

        // queued 事件必须先于入队发布，晋升后才会有 started
        for (i, task) in tasks.iter().enumerate() {
            info!(
                "📥 任务入队: {} ({} 字节, 优先级 {})",
                task.id,
                task.total_size(),
                task.priority
            );
            self.ctx().bus.emit(UploadEvent::UploadQueued {
                task_id: task.id.clone(),
                total_size: task.total_size(),
                priority: task.priority,
                position: base_position + i,
            });
        }

        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let rejected = {
            let mut state = self.inner.state.lock();
            if state.closed {
                tasks
            } else {
                state.pending.extend(tasks);
                Vec::new()
            }
        };

        // 入队前队列被关闭
        if !rejected.is_empty() {
            for task in rejected {
                self.cancel_queued(task);
            }
            return Err(UploadError::Validation("上传队列已关闭".to_string()));
        }

        self.promote();
        Ok(ids)
    }

    // =====================================================
    // 晋升
    // =====================================================

    /// 在并发上限内晋升等待任务
    fn promote(&self) {
        while let Some(promotion) = self.promote_one() {
            self.launch(promotion);
        }
    }

    fn promote_one(&self) -> Option<Promotion> {
        let limit = self.ctx().file_limit();
        let chunk_size = self.ctx().chunk_size();
        let mode = self.ctx().config.read().priority_mode;

        let mut state = self.inner.state.lock();
        if state.closed || state.active.len() >= limit {
            return None;
        }
        let index = state.next_pending(mode)?;
        let queued = state.pending.remove(index);
        let task_id = queued.id.clone();

        let task = Arc::new(AsyncMutex::new(UploadTask::from_queued(queued, chunk_size)));
        // 新建的锁不可能被占用；在状态锁内拿到任务锁，保证 started 先于该任务的其他事件
        let guard = match task.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("任务 {} 晋升时任务锁被占用，跳过", task_id);
                return None;
            }
        };
        let control = Arc::new(Notify::new());
        state.active.insert(
            task_id.clone(),
            ActiveEntry {
                task: task.clone(),
                control: control.clone(),
            },
        );
        let active = state.active.len();
        drop(state);

        self.ctx().optimizer.set_active_concurrency(active);
        debug!("活跃任务数: {}/{}", active, limit);

        Some(Promotion {
            task_id,
            guard,
            task,
            control,
        })
    }

    /// 发布 started 事件并启动分片调度器
    fn launch(&self, promotion: Promotion) {
        let Promotion {
            task_id,
            guard,
            task,
            control,
        } = promotion;

        info!(
            "🚀 开始上传任务: {} ({} 字节, 分片 {} 字节 x {})",
            task_id, guard.total_size, guard.chunk_size, guard.total_chunks
        );
        self.ctx().bus.emit(UploadEvent::UploadStarted {
            task_id: task_id.clone(),
            total_size: guard.total_size,
            chunk_size: guard.chunk_size,
            total_chunks: guard.total_chunks,
        });

        let payload = guard.payload.clone();
        let token = guard.cancel_token.clone();
        drop(guard);

        let ctx = self.ctx().clone();
        let scheduler = ChunkScheduler::new(ctx.clone(), task, control, task_id.clone(), payload, token);
        tokio::spawn(async move {
            let outcome = scheduler.run().await;
            if ctx
                .notices
                .send(EngineNotice::TaskFinished { task_id, outcome })
                .is_err()
            {
                debug!("协调器已释放，忽略任务结束通知");
            }
        });
    }

    /// 任务进入终态后释放槽位
    async fn finish_task(&self, task_id: String, outcome: TaskOutcome) {
        let task = {
            let state = self.inner.state.lock();
            match state.active.get(&task_id) {
                Some(entry) => entry.task.clone(),
                None => return,
            }
        };
        let snapshot = task.lock().await.snapshot();

        match &outcome {
            TaskOutcome::Completed => self.ctx().optimizer.record_outcome(true),
            TaskOutcome::Failed(_) => self.ctx().optimizer.record_outcome(false),
            TaskOutcome::Cancelled => self.ctx().optimizer.record_cancelled(),
        }

        let (drained, active) = {
            let mut state = self.inner.state.lock();
            state.active.remove(&task_id);
            state.record_finished(snapshot);
            (state.is_drained(), state.active.len())
        };
        self.ctx().optimizer.set_active_concurrency(active);
        debug!("任务 {} 释放槽位: {:?}", task_id, outcome);

        self.promote();
        if drained {
            self.emit_queue_empty();
        }
    }

    fn emit_queue_empty(&self) {
        // 晋升后可能又有了新任务
        if self.inner.state.lock().is_drained() {
            info!("✓ 上传队列已清空");
            self.ctx().bus.emit(UploadEvent::QueueEmpty);
        }
    }

    // =====================================================
    // 任务控制
    // =====================================================

    fn active_handles(&self, task_id: &str) -> Option<(Arc<AsyncMutex<UploadTask>>, Arc<Notify>)> {
        self.inner
            .state
            .lock()
            .active
            .get(task_id)
            .map(ActiveEntry::clone_handles)
    }

    fn not_found(task_id: &str) -> UploadError {
        UploadError::Validation(format!("任务不存在: {}", task_id))
    }

    /// 取消任务
    pub async fn cancel(&self, task_id: &str) -> UploadResult<()> {
        let queued = {
            let mut state = self.inner.state.lock();
            let index = state.pending.iter().position(|t| t.id == task_id);
            index.map(|index| state.pending.remove(index))
        };
        if let Some(task) = queued {
            self.cancel_queued(task);
            self.emit_queue_empty();
            return Ok(());
        }

        let Some((task, _)) = self.active_handles(task_id) else {
            let finished = self.inner.state.lock().finished.contains_key(task_id);
            return Err(if finished {
                UploadError::Validation(format!("任务 {} 已结束", task_id))
            } else {
                Self::not_found(task_id)
            });
        };

        let mut guard = task.lock().await;
        if !guard.mark_cancelled() {
            return Err(UploadError::Validation(format!(
                "任务 {} 当前状态 {} 不能取消",
                task_id,
                guard.status.as_str()
            )));
        }
        info!("取消上传任务: {}", task_id);
        self.ctx().bus.emit(UploadEvent::UploadCancelled {
            task_id: task_id.to_string(),
        });
        // 状态已是 cancelled，调度器不会再提交进度
        guard.cancel_token.cancel();
        Ok(())
    }

    fn cancel_queued(&self, task: QueuedTask) {
        info!("取消排队中的上传任务: {}", task.id);
        let mut snapshot = task.snapshot();
        snapshot.status = UploadStatus::Cancelled;
        snapshot.completed_at = Some(chrono::Utc::now().timestamp_millis());

        self.ctx().optimizer.record_cancelled();
        self.inner.state.lock().record_finished(snapshot);
        self.ctx()
            .bus
            .emit(UploadEvent::UploadCancelled { task_id: task.id });
    }

    /// 暂停任务
    ///
    /// 排队中的任务暂停后不会被晋升；活跃任务停止派发新分片，在途分片允许完成
    pub async fn pause(&self, task_id: &str) -> UploadResult<()> {
        let queued = {
            let mut state = self.inner.state.lock();
            let changed = match state.pending.iter_mut().find(|t| t.id == task_id) {
                Some(task) if task.paused => Some(false),
                Some(task) => {
                    task.paused = true;
                    Some(true)
                }
                None => None,
            };
            changed
        };
        match queued {
            Some(true) => {
                info!("暂停排队中的上传任务: {}", task_id);
                self.ctx().bus.emit(UploadEvent::UploadPaused {
                    task_id: task_id.to_string(),
                });
                return Ok(());
            }
            Some(false) => {
                return Err(UploadError::Validation(format!("任务 {} 已暂停", task_id)))
            }
            None => {}
        }

        let (task, _) = self
            .active_handles(task_id)
            .ok_or_else(|| Self::not_found(task_id))?;
        let mut guard = task.lock().await;
        if !guard.mark_paused() {
            return Err(UploadError::Validation(format!(
                "任务 {} 当前状态 {} 不能暂停",
                task_id,
                guard.status.as_str()
            )));
        }
        info!("⏸ 暂停上传任务: {}", task_id);
        self.ctx().bus.emit(UploadEvent::UploadPaused {
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    /// 恢复任务
    pub async fn resume(&self, task_id: &str) -> UploadResult<()> {
        let queued = {
            let mut state = self.inner.state.lock();
            let changed = match state.pending.iter_mut().find(|t| t.id == task_id) {
                Some(task) if !task.paused => Some(false),
                Some(task) => {
                    task.paused = false;
                    Some(true)
                }
                None => None,
            };
            changed
        };
        match queued {
            Some(true) => {
                info!("恢复排队中的上传任务: {}", task_id);
                self.ctx().bus.emit(UploadEvent::UploadResumed {
                    task_id: task_id.to_string(),
                    resume_count: 0,
                });
                self.promote();
                return Ok(());
            }
            Some(false) => {
                return Err(UploadError::Validation(format!("任务 {} 未暂停", task_id)))
            }
            None => {}
        }

        let (task, control) = self
            .active_handles(task_id)
            .ok_or_else(|| Self::not_found(task_id))?;
        let mut guard = task.lock().await;
        if !guard.mark_resumed() {
            return Err(UploadError::Validation(format!(
                "任务 {} 当前状态 {} 不能恢复",
                task_id,
                guard.status.as_str()
            )));
        }
        info!("▶ 恢复上传任务: {} (第 {} 次)", task_id, guard.resume_count);
        self.ctx().bus.emit(UploadEvent::UploadResumed {
            task_id: task_id.to_string(),
            resume_count: guard.resume_count,
        });
        drop(guard);
        control.notify_one();
        Ok(())
    }

    /// 暂停所有可暂停的任务，返回成功暂停的数量
    pub async fn pause_all(&self) -> usize {
        let mut paused = 0;
        for task_id in self.task_ids() {
            if self.pause(&task_id).await.is_ok() {
                paused += 1;
            }
        }
        info!("暂停全部上传任务: {} 个", paused);
        paused
    }

    /// 恢复所有已暂停的任务，返回成功恢复的数量
    pub async fn resume_all(&self) -> usize {
        let mut resumed = 0;
        for task_id in self.task_ids() {
            if self.resume(&task_id).await.is_ok() {
                resumed += 1;
            }
        }
        info!("恢复全部上传任务: {} 个", resumed);
        resumed
    }

    /// 活跃任务在前，排队任务按队列顺序在后
    fn task_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .active
            .keys()
            .cloned()
            .chain(state.pending.iter().map(|t| t.id.clone()))
            .collect()
    }

    // =====================================================
    // 查询
    // =====================================================

    pub async fn get_status(&self) -> QueueStatus {
        let (mut status, tasks) = {
            let state = self.inner.state.lock();
            let paused_queued = state.pending.iter().filter(|t| t.paused).count();
            let status = QueueStatus {
                queued: state.pending.len() - paused_queued,
                active: state.active.len(),
                paused: paused_queued,
                completed: state.completed,
                failed: state.failed,
                cancelled: state.cancelled,
                max_concurrent_files: 0,
                effective_file_limit: 0,
            };
            let tasks: Vec<_> = state.active.values().map(|e| e.task.clone()).collect();
            (status, tasks)
        };

        for task in tasks {
            if task.lock().await.is_paused() {
                status.paused += 1;
            }
        }
        status.max_concurrent_files = self.ctx().config.read().max_concurrent_files;
        status.effective_file_limit = self.ctx().file_limit();
        status
    }

    /// 查询单个任务（排队、活跃或已结束）
    pub async fn get_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        let task = {
            let state = self.inner.state.lock();
            if let Some(queued) = state.pending.iter().find(|t| t.id == task_id) {
                return Some(queued.snapshot());
            }
            if let Some(finished) = state.finished.get(task_id) {
                return Some(finished.clone());
            }
            state.active.get(task_id).map(|e| e.task.clone())
        }?;
        let snapshot = task.lock().await.snapshot();
        Some(snapshot)
    }

    /// 全部任务快照，按入队时间排序
    pub async fn list_tasks(&self) -> Vec<TaskSnapshot> {
        let (mut snapshots, tasks) = {
            let state = self.inner.state.lock();
            let snapshots: Vec<TaskSnapshot> = state
                .pending
                .iter()
                .map(QueuedTask::snapshot)
                .chain(state.finished.values().cloned())
                .collect();
            let tasks: Vec<_> = state.active.values().map(|e| e.task.clone()).collect();
            (snapshots, tasks)
        };
        for task in tasks {
            snapshots.push(task.lock().await.snapshot());
        }
        snapshots.sort_by_key(|s| s.enqueue_time);
        snapshots
    }

    /// 清除已结束任务的记录，返回清除数量
    pub fn clear_finished(&self) -> usize {
        let removed = self.inner.state.lock().clear_finished();
        if removed > 0 {
            info!("清除了 {} 个已结束的上传任务", removed);
        }
        removed
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.ctx().optimizer.metrics()
    }

    pub fn network_metrics(&self) -> NetworkMetrics {
        self.ctx().monitor.metrics()
    }

    // =====================================================
    // 配置
    // =====================================================

    pub fn config(&self) -> QueueConfig {
        self.ctx().config.read().clone()
    }

    /// 合并部分配置
    ///
    /// 只影响之后的调度决策，不中断在途操作；校验失败时配置保持不变
    pub fn update_config(&self, patch: QueueConfigPatch) -> UploadResult<QueueConfig> {
        let updated = {
            let mut config = self.ctx().config.write();
            config.apply(&patch)?;
            config.clone()
        };
        info!(
            "🔧 队列配置已更新: 并发文件 {}, 并发分片 {}, 重试 {} 次, 模式 {:?}",
            updated.max_concurrent_files,
            updated.max_concurrent_chunks,
            updated.retry_attempts,
            updated.priority_mode
        );

        self.wake_active();
        self.promote();
        Ok(updated)
    }

    /// 唤醒所有调度器重新评估并发上限
    fn wake_active(&self) {
        let controls: Vec<Arc<Notify>> = self
            .inner
            .state
            .lock()
            .active
            .values()
            .map(|e| e.control.clone())
            .collect();
        for control in controls {
            control.notify_one();
        }
    }

    // =====================================================
    // 事件订阅
    // =====================================================

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.ctx().bus.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.ctx().bus.subscribe_all(handler)
    }

    pub fn subscribe_channel(
        &self,
        kind: Option<EventKind>,
    ) -> (Subscription, mpsc::UnboundedReceiver<UploadEvent>) {
        self.ctx().bus.subscribe_channel(kind)
    }

    pub fn event_bus(&self) -> EventBus {
        self.ctx().bus.clone()
    }

    // =====================================================
    // 网络与性能
    // =====================================================

    /// 立即执行一次网络采样
    ///
    /// 网络状况变化时发布 network-change，并按新档位调整之后创建的分片大小
    pub fn refresh_network(&self) -> Option<NetworkChange> {
        let change = self.ctx().monitor.refresh()?;

        if self.ctx().config.read().network_optimization {
            let size = recommended_chunk_size(&change.metrics, &self.ctx().chunk);
            self.ctx().optimizer.set_chunk_size(size);
        }
        info!(
            "📶 网络状况变化: {} -> {} ({:.0} B/s)",
            change.previous_type, change.metrics.effective_type, change.metrics.speed
        );
        self.ctx().bus.emit(UploadEvent::NetworkChange {
            metrics: change.metrics.clone(),
            previous_type: change.previous_type,
        });

        self.wake_active();
        self.promote();
        Some(change)
    }

    /// 立即执行一次性能优化周期，发布 performance-update
    pub fn optimize_now(&self) -> PerformanceMetrics {
        let active = self.inner.state.lock().active.len();
        self.ctx().optimizer.set_active_concurrency(active);

        let config = self.config();
        let metrics = if config.adaptive_optimization {
            let network = self.ctx().monitor.metrics();
            // 启用网络优化时，优化器的分片增长不越过当前网络档位的建议值
            let ceiling = config
                .network_optimization
                .then(|| recommended_chunk_size(&network, &self.ctx().chunk));
            let adjustment =
                self.ctx()
                    .optimizer
                    .adjust(&network, config.max_concurrent_files, ceiling);
            if adjustment.changed() {
                self.wake_active();
                self.promote();
            }
            adjustment.metrics
        } else {
            self.ctx().optimizer.metrics()
        };

        self.ctx().bus.emit(UploadEvent::PerformanceUpdate {
            metrics: metrics.clone(),
        });
        metrics
    }

    // =====================================================
    // 后台任务
    // =====================================================

    fn spawn_background(&self, mut notices: mpsc::UnboundedReceiver<EngineNotice>) {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let notice_loop = tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(coordinator) = upgrade(&weak) else {
                    break;
                };
                match notice {
                    EngineNotice::TaskFinished { task_id, outcome } => {
                        coordinator.finish_task(task_id, outcome).await
                    }
                }
            }
            debug!("任务通知循环退出");
        });

        let network_loop = spawn_periodic(
            Arc::downgrade(&self.inner),
            shutdown.clone(),
            self.ctx().monitor.sample_interval(),
            |coordinator| {
                coordinator.refresh_network();
            },
        );

        let optimizer_loop = spawn_periodic(
            Arc::downgrade(&self.inner),
            shutdown,
            self.ctx().optimizer.adjust_interval(),
            |coordinator| {
                coordinator.optimize_now();
            },
        );

        self.inner
            .background
            .lock()
            .extend([notice_loop, network_loop, optimizer_loop]);
    }

    // =====================================================
    // 关闭
    // =====================================================

    /// 关闭协调器
    ///
    /// 取消所有排队和活跃任务，等待调度器退出，停止周期任务并移除所有订阅者
    pub async fn shutdown(&self) {
        let (pending, active) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let pending = std::mem::take(&mut state.pending);
            let active: Vec<String> = state.active.keys().cloned().collect();
            (pending, active)
        };
        info!(
            "正在关闭上传队列: 排队 {} 个, 活跃 {} 个",
            pending.len(),
            active.len()
        );

        for task in pending {
            self.cancel_queued(task);
        }
        for task_id in active {
            if let Err(e) = self.cancel(&task_id).await {
                debug!("关闭时取消任务 {} 跳过: {}", task_id, e);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let drained = self.inner.state.lock().active.is_empty();
            if drained {
                break;
            }
            if Instant::now() >= deadline {
                warn!("等待活跃任务退出超时");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.inner.shutdown.cancel();
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        self.ctx().bus.clear();
        info!("上传队列已关闭");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

fn upgrade(weak: &Weak<CoordinatorInner>) -> Option<QueueCoordinator> {
    weak.upgrade().map(|inner| QueueCoordinator { inner })
}

/// 周期任务，首次执行在一个周期之后
fn spawn_periodic<F>(
    weak: Weak<CoordinatorInner>,
    shutdown: CancellationToken,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(&QueueCoordinator) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let Some(coordinator) = upgrade(&weak) else {
                        break;
                    };
                    tick(&coordinator);
                }
            }
        }
    })
}

fn validate_request(request: &SubmitRequest) -> UploadResult<()> {
    if request.payload.size() == 0 {
        return Err(UploadError::Validation("上传内容为空".to_string()));
    }
    if request.session.session_id.trim().is_empty() {
        return Err(UploadError::Validation("缺少会话 ID".to_string()));
    }
    Ok(())
}
