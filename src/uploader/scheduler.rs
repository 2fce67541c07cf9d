// 单任务分片调度器
//
// 每个活跃任务一个调度器，负责：
// 1. 初始化远端上传会话
// 2. 按当前分片大小切分并并发上传分片（不超过并发分片上限）
// 3. 全部分片完成后合并
//
// 暂停时不再派发新分片，已在途的分片允许完成；
// 取消时立即丢弃在途分片（JoinSet 析构会中止所有分片任务），
// 失败或取消后尽力放弃远端上传会话。
//
// 初始化、每个分片、合并各自持有独立的重试预算，
// 任务的 retry_count 为所有操作重试次数之和。

use super::chunk::{ChunkPlanner, CompletedChunk, UploadChunk};
use super::context::{EngineContext, TaskOutcome};
use super::payload::PayloadHandle;
use super::retry::{guarded, run_with_retry, RetryBudget, RetryPolicy};
use super::task::{UploadStatus, UploadTask};
use crate::error::{UploadError, UploadResult};
use crate::events::UploadEvent;
use crate::transport::{ChunkReceipt, FinalizeResult, UploadMetadata, UploadTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单个分片的上传作业
struct ChunkJob {
    transport: Arc<dyn UploadTransport>,
    payload: PayloadHandle,
    upload_id: String,
    chunk: UploadChunk,
    policy: RetryPolicy,
    timeout: Duration,
    token: CancellationToken,
    label: String,
}

/// 分片作业结果
struct ChunkResult {
    chunk: UploadChunk,
    result: UploadResult<ChunkReceipt>,
    /// 成功那次尝试的耗时
    elapsed: Duration,
    /// 该分片发生的重试次数
    retries: u32,
}

async fn upload_one_chunk(job: ChunkJob) -> ChunkResult {
    let data = match guarded(
        job.payload.read_range(job.chunk.range.clone()),
        job.timeout,
        &job.token,
    )
    .await
    {
        Ok(data) => data,
        Err(e) => {
            return ChunkResult {
                chunk: job.chunk,
                result: Err(e),
                elapsed: Duration::ZERO,
                retries: 0,
            }
        }
    };

    let budget = RetryBudget::new();
    let index = job.chunk.index;
    let transport = &job.transport;
    let upload_id = &job.upload_id;
    let token = &job.token;
    let outcome = run_with_retry(
        &job.label,
        &job.policy,
        job.timeout,
        &job.token,
        &budget,
        || {
            let transport = transport.clone();
            let upload_id = upload_id.clone();
            let token = token.clone();
            let data = data.clone();
            async move { transport.upload_chunk(&upload_id, index, data, &token).await }
        },
    )
    .await;

    ChunkResult {
        chunk: job.chunk,
        result: outcome.result,
        elapsed: outcome.elapsed,
        retries: outcome.retries,
    }
}

pub(crate) struct ChunkScheduler {
    ctx: Arc<EngineContext>,
    task: Arc<Mutex<UploadTask>>,
    /// 恢复、配置变化、网络变化时唤醒调度器重新评估
    control: Arc<Notify>,
    task_id: String,
    payload: PayloadHandle,
    token: CancellationToken,
    planner: ChunkPlanner,
    /// 所有操作累计的重试次数
    retries: u32,
    in_flight: usize,
}

impl ChunkScheduler {
    pub fn new(
        ctx: Arc<EngineContext>,
        task: Arc<Mutex<UploadTask>>,
        control: Arc<Notify>,
        task_id: String,
        payload: PayloadHandle,
        token: CancellationToken,
    ) -> Self {
        let planner = ChunkPlanner::new(payload.size());
        Self {
            ctx,
            task,
            control,
            task_id,
            payload,
            token,
            planner,
            retries: 0,
            in_flight: 0,
        }
    }

    /// 运行到任务进入终态
    pub async fn run(mut self) -> TaskOutcome {
        let outcome = match self.drive().await {
            Ok(finalized) => self.complete(finalized).await,
            Err(UploadError::Cancelled) => {
                self.ensure_cancelled().await;
                TaskOutcome::Cancelled
            }
            Err(e) => self.fail(e).await,
        };

        if outcome != TaskOutcome::Completed {
            self.abort_remote().await;
        }
        outcome
    }

    async fn drive(&mut self) -> UploadResult<FinalizeResult> {
        let upload_id = self.initiate().await?;
        self.transfer_chunks(&upload_id).await?;
        self.finalize(&upload_id).await
    }

    fn label(&self, op: &str) -> String {
        format!("任务 {} {}", self.task_id, op)
    }

    /// 初始化远端上传会话
    async fn initiate(&mut self) -> UploadResult<String> {
        let metadata = {
            let task = self.task.lock().await;
            UploadMetadata {
                task_id: task.id.clone(),
                file_name: self.payload.name().map(|n| n.to_string()),
                content_type: self.payload.content_type().map(|c| c.to_string()),
                total_size: task.total_size,
                chunk_size: task.chunk_size,
                session: task.session.clone(),
            }
        };

        let policy = self.ctx.retry_policy();
        let transport = self.ctx.transport.clone();
        let budget = RetryBudget::new();
        let outcome = run_with_retry(
            &self.label("初始化上传"),
            &policy,
            self.ctx.operation_timeout(),
            &self.token,
            &budget,
            || {
                let transport = transport.clone();
                let metadata = metadata.clone();
                async move { transport.initiate_multipart_upload(&metadata).await }
            },
        )
        .await;

        self.retries += outcome.retries;
        let mut task = self.task.lock().await;
        task.retry_count = self.retries;
        let upload_id = outcome.result?;

        // 先记录会话 ID，取消时可以放弃远端会话
        task.mark_uploading(upload_id.clone());
        if task.is_terminal() {
            return Err(UploadError::Cancelled);
        }

        info!("任务 {} 远端上传会话已建立: {}", self.task_id, upload_id);
        Ok(upload_id)
    }

    /// 分片上传主循环
    async fn transfer_chunks(&mut self, upload_id: &str) -> UploadResult<()> {
        let mut join_set: JoinSet<ChunkResult> = JoinSet::new();

        loop {
            if self.token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            self.dispatch(&mut join_set, upload_id).await;

            if join_set.is_empty() {
                if !self.planner.has_remaining() {
                    return Ok(());
                }
                // 暂停中：等待恢复或取消
                tokio::select! {
                    _ = self.token.cancelled() => return Err(UploadError::Cancelled),
                    _ = self.control.notified() => continue,
                }
            }

            tokio::select! {
                _ = self.token.cancelled() => return Err(UploadError::Cancelled),
                _ = self.control.notified() => {}
                joined = join_set.join_next() => {
                    if let Some(joined) = joined {
                        self.in_flight = self.in_flight.saturating_sub(1);
                        let result = joined.map_err(|e| {
                            UploadError::Network(format!("分片任务异常退出: {}", e))
                        })?;
                        self.commit(result).await?;
                    }
                }
            }
        }
    }

    /// 在并发上限内派发新分片
    async fn dispatch(&mut self, join_set: &mut JoinSet<ChunkResult>, upload_id: &str) {
        let limit = self.ctx.chunk_limit();
        if self.in_flight >= limit || !self.planner.has_remaining() {
            return;
        }

        let task_ref = self.task.clone();
        let mut task = task_ref.lock().await;
        if task.status != UploadStatus::Uploading {
            return;
        }

        let chunk_size = self.ctx.chunk_size();
        let policy = self.ctx.retry_policy();
        let timeout = self.ctx.operation_timeout();

        while self.in_flight < limit {
            let Some(chunk) = self.planner.next_chunk(chunk_size) else {
                break;
            };

            if task.chunk_size != chunk_size {
                debug!(
                    "任务 {} 分片大小调整: {} -> {}",
                    self.task_id, task.chunk_size, chunk_size
                );
            }
            task.chunk_size = chunk_size;
            task.current_chunk_index = chunk.index;
            task.total_chunks = self.planner.estimated_total_chunks(chunk_size);

            debug!(
                "任务 {} 派发分片 #{} ({}..{})",
                self.task_id, chunk.index, chunk.range.start, chunk.range.end
            );

            join_set.spawn(upload_one_chunk(ChunkJob {
                transport: self.ctx.transport.clone(),
                payload: self.payload.clone(),
                upload_id: upload_id.to_string(),
                label: format!("任务 {} 分片 #{}", self.task_id, chunk.index),
                chunk,
                policy: policy.clone(),
                timeout,
                token: self.token.clone(),
            }));
            self.in_flight += 1;
        }
    }

    /// 提交分片结果
    async fn commit(&mut self, result: ChunkResult) -> UploadResult<()> {
        let ChunkResult {
            chunk,
            result,
            elapsed,
            retries,
        } = result;

        self.retries += retries;
        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                self.task.lock().await.retry_count = self.retries;
                return Err(e);
            }
        };

        let size = chunk.size();
        if receipt.size != size {
            warn!(
                "任务 {} 分片 #{} 服务端确认 {} 字节，本地分片 {} 字节",
                self.task_id, chunk.index, receipt.size, size
            );
        }
        self.ctx.monitor.record_transfer(size, elapsed);
        self.ctx.optimizer.record_transfer(size, elapsed);

        let mut task = self.task.lock().await;
        task.retry_count = self.retries;
        // 取消后不再产生进度
        if task.is_terminal() {
            return Ok(());
        }

        let accepted = task.record_chunk(CompletedChunk {
            index: chunk.index,
            checksum: receipt.checksum,
            size,
        });
        if !accepted {
            warn!("任务 {} 分片 #{} 重复提交，已忽略", self.task_id, chunk.index);
            return Ok(());
        }

        task.update_speed(size);
        let update = task.progress_update();
        self.ctx.bus.emit(UploadEvent::UploadProgress {
            task_id: self.task_id.clone(),
            uploaded_bytes: update.uploaded_bytes,
            total_bytes: update.total_bytes,
            percent: update.percent,
            speed: update.speed,
            eta_secs: update.eta_secs,
            completed_chunks: update.completed_chunks,
            total_chunks: update.total_chunks,
        });
        if let Some(callback) = &task.callbacks.on_progress {
            callback(&update);
        }

        debug!(
            "任务 {} 分片 #{} 完成 ({}/{}, {:.1}%)",
            self.task_id,
            chunk.index,
            update.completed_chunks,
            update.total_chunks,
            update.percent
        );
        Ok(())
    }

    /// 合并分片
    async fn finalize(&mut self, upload_id: &str) -> UploadResult<FinalizeResult> {
        // 全部分片完成时若处于暂停状态，等待恢复后再合并
        let chunks = loop {
            {
                let mut task = self.task.lock().await;
                match task.status {
                    UploadStatus::Uploading => {
                        if !task.covers_all_chunks() {
                            return Err(UploadError::Finalize(format!(
                                "分片不完整: {}/{}",
                                task.completed_chunk_count(),
                                task.total_chunks
                            )));
                        }
                        task.mark_completing();
                        break task.completed_chunk_list();
                    }
                    UploadStatus::Paused => {}
                    _ => return Err(UploadError::Cancelled),
                }
            }
            tokio::select! {
                _ = self.token.cancelled() => return Err(UploadError::Cancelled),
                _ = self.control.notified() => {}
            }
        };

        info!(
            "任务 {} 全部 {} 个分片上传完成，开始合并",
            self.task_id,
            chunks.len()
        );

        let policy = self.ctx.retry_policy();
        let transport = self.ctx.transport.clone();
        let chunks = Arc::new(chunks);
        let budget = RetryBudget::new();
        let outcome = run_with_retry(
            &self.label("合并分片"),
            &policy,
            self.ctx.operation_timeout(),
            &self.token,
            &budget,
            || {
                let transport = transport.clone();
                let chunks = chunks.clone();
                let upload_id = upload_id.to_string();
                async move {
                    transport
                        .complete_multipart_upload(&upload_id, &chunks)
                        .await
                }
            },
        )
        .await;

        self.retries += outcome.retries;
        self.task.lock().await.retry_count = self.retries;
        match outcome.result {
            Ok(result) => Ok(result),
            Err(UploadError::Cancelled) => Err(UploadError::Cancelled),
            Err(e) => Err(UploadError::Finalize(e.to_string())),
        }
    }

    async fn complete(&self, finalized: FinalizeResult) -> TaskOutcome {
        let mut task = self.task.lock().await;
        if !task.mark_completed() {
            return TaskOutcome::Cancelled;
        }

        let upload_id = task.remote_upload_id.clone().unwrap_or_default();
        info!(
            "✓ 任务 {} 上传完成: {} 字节，{} 个分片，重试 {} 次",
            self.task_id, task.total_size, task.total_chunks, task.retry_count
        );

        self.ctx.bus.emit(UploadEvent::UploadCompleted {
            task_id: self.task_id.clone(),
            upload_id,
            total_bytes: task.total_size,
            duration_ms: task.elapsed_ms(),
            retry_count: task.retry_count,
            location: finalized.location.clone(),
        });
        if let Some(callback) = &task.callbacks.on_complete {
            callback(&finalized);
        }
        TaskOutcome::Completed
    }

    /// 标记失败，每个任务最多发布一次 upload-error
    async fn fail(&self, err: UploadError) -> TaskOutcome {
        let mut task = self.task.lock().await;
        task.retry_count = self.retries;
        if !task.mark_failed(err.clone()) {
            // 已被取消
            return TaskOutcome::Cancelled;
        }

        error!("任务 {} 上传失败: {}", self.task_id, err);
        self.ctx.bus.emit(UploadEvent::UploadError {
            task_id: self.task_id.clone(),
            kind: err.kind(),
            message: err.to_string(),
            retry_count: task.retry_count,
        });
        if let Some(callback) = &task.callbacks.on_error {
            callback(&err);
        }
        TaskOutcome::Failed(err)
    }

    /// 协议层主动返回取消时，任务状态也要进入 cancelled
    async fn ensure_cancelled(&self) {
        let mut task = self.task.lock().await;
        if task.mark_cancelled() {
            warn!("任务 {} 被上传协议取消", self.task_id);
            self.ctx.bus.emit(UploadEvent::UploadCancelled {
                task_id: self.task_id.clone(),
            });
        }
    }

    /// 尽力放弃远端上传会话
    async fn abort_remote(&self) {
        let upload_id = self.task.lock().await.remote_upload_id.clone();
        let Some(upload_id) = upload_id else {
            return;
        };

        // 任务令牌此时可能已取消，使用独立令牌
        let token = CancellationToken::new();
        let result = guarded(
            self.ctx.transport.abort_multipart_upload(&upload_id),
            self.ctx.operation_timeout(),
            &token,
        )
        .await;
        match result {
            Ok(()) => debug!("任务 {} 已放弃远端会话 {}", self.task_id, upload_id),
            Err(e) => warn!(
                "任务 {} 放弃远端会话 {} 失败: {}",
                self.task_id, upload_id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkConfig, NetworkConfig, OptimizerConfig, QueueConfig, RetryConfig};
    use crate::error::ErrorKind;
    use crate::events::{EventBus, EventKind};
    use crate::network::NetworkMonitor;
    use crate::optimizer::PerformanceOptimizer;
    use crate::transport::InMemoryTransport;
    use crate::uploader::payload::MemoryPayload;
    use crate::uploader::task::{QueuedTask, SessionContext, TaskCallbacks};
    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    const KB: u64 = 1024;

    fn context(transport: &InMemoryTransport, queue: QueueConfig, timeout_ms: u64) -> Arc<EngineContext> {
        let chunk = ChunkConfig {
            min_chunk_size: 16 * KB,
            default_chunk_size: 64 * KB,
            max_chunk_size: 256 * KB,
        };
        let (notices, _) = mpsc::unbounded_channel();
        Arc::new(EngineContext {
            config: RwLock::new(queue),
            optimizer: PerformanceOptimizer::new(OptimizerConfig::default(), chunk.clone()),
            chunk,
            retry: RetryConfig {
                max_delay_ms: 20,
                jitter: 0.0,
                operation_timeout_ms: timeout_ms,
            },
            transport: Arc::new(transport.clone()),
            bus: EventBus::new(),
            monitor: NetworkMonitor::new(NetworkConfig::default(), None),
            notices,
        })
    }

    fn queue_config(retry_attempts: u32, adaptive: bool) -> QueueConfig {
        QueueConfig {
            max_concurrent_files: 1,
            max_concurrent_chunks: 1,
            retry_attempts,
            base_retry_delay_ms: 5,
            adaptive_optimization: adaptive,
            network_optimization: false,
            ..Default::default()
        }
    }

    fn scheduler(ctx: &Arc<EngineContext>, size: u64) -> (ChunkScheduler, Arc<Mutex<UploadTask>>) {
        let payload: PayloadHandle = Arc::new(MemoryPayload::new(vec![7u8; size as usize]));
        let queued = QueuedTask {
            id: "task-1".to_string(),
            payload: payload.clone(),
            session: SessionContext::new("s-1"),
            priority: 0,
            enqueue_time: 0,
            sequence: 0,
            paused: false,
            callbacks: TaskCallbacks::default(),
        };
        let upload = UploadTask::from_queued(queued, ctx.chunk_size());
        let token = upload.cancel_token.clone();
        let task = Arc::new(Mutex::new(upload));
        let scheduler = ChunkScheduler::new(
            ctx.clone(),
            task.clone(),
            Arc::new(Notify::new()),
            "task-1".to_string(),
            payload,
            token,
        );
        (scheduler, task)
    }

    #[tokio::test]
    async fn test_chunk_size_change_applies_to_new_chunks() {
        let transport = InMemoryTransport::new().with_latency(Duration::from_millis(20));
        let ctx = context(&transport, queue_config(3, true), 2_000);
        let (_sub, mut rx) = ctx.bus.subscribe_channel(Some(EventKind::UploadProgress));
        let (scheduler, task) = scheduler(&ctx, 256 * KB);

        let handle = tokio::spawn(scheduler.run());
        rx.recv().await.unwrap();
        ctx.optimizer.set_chunk_size(16 * KB);

        assert_eq!(handle.await.unwrap(), TaskOutcome::Completed);
        let task = task.lock().await;
        let upload_id = task.remote_upload_id.clone().unwrap();
        let sizes = transport.part_sizes(&upload_id);
        assert_eq!(sizes[0], 64 * KB);
        assert_eq!(*sizes.last().unwrap(), 16 * KB);
        assert_eq!(sizes.iter().sum::<u64>(), 256 * KB);
        assert_eq!(task.total_chunks, sizes.len());
        assert!(task.covers_all_chunks());
    }

    #[tokio::test]
    async fn test_chunk_timeout_fails_task() {
        let transport = InMemoryTransport::new().with_latency(Duration::from_millis(300));
        let ctx = context(&transport, queue_config(1, false), 50);
        let (scheduler, task) = scheduler(&ctx, 64 * KB);

        match scheduler.run().await {
            TaskOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::Timeout),
            other => panic!("unexpected outcome {:?}", other),
        }
        let task = task.lock().await;
        assert_eq!(task.status, UploadStatus::Error);
        assert_eq!(task.retry_count, 1);
        assert!(transport
            .aborted_uploads()
            .contains(task.remote_upload_id.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_initiate_rejection_skips_abort() {
        let transport = InMemoryTransport::new();
        transport.fail_initiate(vec![UploadError::from_status(401, "expired", None)]);
        let ctx = context(&transport, queue_config(3, false), 2_000);
        let (_sub, mut rx) = ctx.bus.subscribe_channel(None);
        let (scheduler, task) = scheduler(&ctx, 64 * KB);

        assert!(matches!(scheduler.run().await, TaskOutcome::Failed(_)));
        assert!(transport.aborted_uploads().is_empty());
        assert!(task.lock().await.remote_upload_id.is_none());

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            UploadEvent::UploadError {
                kind: ErrorKind::Client,
                retry_count: 0,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_each_chunk_has_its_own_retry_budget() {
        let transport = InMemoryTransport::new();
        for index in 0..4 {
            transport.fail_chunk(index, vec![UploadError::Network("reset".into())]);
        }
        let ctx = context(&transport, queue_config(3, false), 2_000);
        let (_sub, mut rx) = ctx.bus.subscribe_channel(Some(EventKind::UploadError));
        let (scheduler, task) = scheduler(&ctx, 4 * 64 * KB);

        assert_eq!(scheduler.run().await, TaskOutcome::Completed);
        let task = task.lock().await;
        assert_eq!(task.status, UploadStatus::Completed);
        // 4 个分片各重试 1 次，合计超过单个操作的重试上限
        assert_eq!(task.retry_count, 4);
        assert_eq!(transport.chunk_calls(), 8);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_paused_task_waits_for_resume() {
        let transport = InMemoryTransport::new().with_latency(Duration::from_millis(10));
        let ctx = context(&transport, queue_config(3, false), 2_000);
        let (scheduler, task) = scheduler(&ctx, 4 * 64 * KB);
        let control = scheduler.control.clone();
        task.lock().await.mark_paused();

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.chunk_calls(), 0);
        assert!(!handle.is_finished());

        task.lock().await.mark_resumed();
        control.notify_one();
        assert_eq!(handle.await.unwrap(), TaskOutcome::Completed);
        assert_eq!(transport.chunk_calls(), 4);
    }
}
