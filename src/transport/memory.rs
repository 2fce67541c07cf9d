// 进程内分片上传实现
//
// 分片保存在内存中，合并时校验分片完整性并拼接出最终对象。
// 支持按分片索引注入错误、注入固定延迟，并记录并发峰值，用于演示和测试。

use super::{ChunkReceipt, FinalizeResult, UploadMetadata, UploadTransport};
use crate::error::{UploadError, UploadResult};
use crate::uploader::CompletedChunk;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct MemoryUpload {
    metadata: UploadMetadata,
    parts: BTreeMap<usize, Vec<u8>>,
    in_flight: usize,
    max_in_flight: usize,
    aborted: bool,
    completed: bool,
}

#[derive(Default)]
struct MemoryInner {
    uploads: DashMap<String, MemoryUpload>,
    /// 合并后的对象
    objects: DashMap<String, Vec<u8>>,
    initiate_failures: Mutex<VecDeque<UploadError>>,
    chunk_failures: Mutex<HashMap<usize, VecDeque<UploadError>>>,
    finalize_failures: Mutex<VecDeque<UploadError>>,
    latency_ms: AtomicU64,
    next_id: AtomicU64,
    chunk_calls: AtomicUsize,
    /// 尚未完成或放弃的上传会话数
    open_uploads: AtomicUsize,
    max_open_uploads: AtomicUsize,
    aborted: Mutex<Vec<String>>,
}

/// 进程内分片上传实现
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<MemoryInner>,
}

/// 分片请求结束时（包括被取消丢弃）减少并发计数
struct InFlightGuard {
    inner: Arc<MemoryInner>,
    upload_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut upload) = self.inner.uploads.get_mut(&self.upload_id) {
            upload.in_flight = upload.in_flight.saturating_sub(1);
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次分片请求的固定延迟
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.latency_ms.load(Ordering::SeqCst))
    }

    /// 让接下来的初始化请求依次返回给定错误
    pub fn fail_initiate(&self, errors: impl IntoIterator<Item = UploadError>) {
        self.inner.initiate_failures.lock().extend(errors);
    }

    /// 让指定索引的分片请求依次返回给定错误
    pub fn fail_chunk(&self, index: usize, errors: impl IntoIterator<Item = UploadError>) {
        self.inner
            .chunk_failures
            .lock()
            .entry(index)
            .or_default()
            .extend(errors);
    }

    /// 让接下来的合并请求依次返回给定错误
    pub fn fail_finalize(&self, errors: impl IntoIterator<Item = UploadError>) {
        self.inner.finalize_failures.lock().extend(errors);
    }

    /// 合并后的对象内容
    pub fn object(&self, upload_id: &str) -> Option<Vec<u8>> {
        self.inner.objects.get(upload_id).map(|o| o.clone())
    }

    /// 按索引排序的已上传分片大小
    pub fn part_sizes(&self, upload_id: &str) -> Vec<u64> {
        self.inner
            .uploads
            .get(upload_id)
            .map(|u| u.parts.values().map(|p| p.len() as u64).collect())
            .unwrap_or_default()
    }

    /// 某个上传会话的分片并发峰值
    pub fn max_in_flight(&self, upload_id: &str) -> usize {
        self.inner
            .uploads
            .get(upload_id)
            .map(|u| u.max_in_flight)
            .unwrap_or(0)
    }

    /// 同时打开的上传会话峰值
    pub fn max_open_uploads(&self) -> usize {
        self.inner.max_open_uploads.load(Ordering::SeqCst)
    }

    pub fn chunk_calls(&self) -> usize {
        self.inner.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.inner.aborted.lock().clone()
    }

    pub fn metadata(&self, upload_id: &str) -> Option<UploadMetadata> {
        self.inner
            .uploads
            .get(upload_id)
            .map(|u| u.metadata.clone())
    }

    fn close_upload(&self, upload: &mut MemoryUpload) {
        if !upload.aborted && !upload.completed {
            self.inner.open_uploads.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl UploadTransport for InMemoryTransport {
    async fn initiate_multipart_upload(&self, metadata: &UploadMetadata) -> UploadResult<String> {
        if let Some(err) = self.inner.initiate_failures.lock().pop_front() {
            return Err(err);
        }

        let id = format!(
            "mem-{}",
            self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.inner.uploads.insert(
            id.clone(),
            MemoryUpload {
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
                in_flight: 0,
                max_in_flight: 0,
                aborted: false,
                completed: false,
            },
        );
        let open = self.inner.open_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_open_uploads.fetch_max(open, Ordering::SeqCst);

        debug!("内存上传会话已创建: {} ({})", id, metadata.task_id);
        Ok(id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> UploadResult<ChunkReceipt> {
        self.inner.chunk_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut upload = self.inner.uploads.get_mut(upload_id).ok_or_else(|| {
                UploadError::from_status(404, format!("上传会话不存在: {}", upload_id), None)
            })?;
            if upload.aborted || upload.completed {
                return Err(UploadError::from_status(409, "上传会话已结束", None));
            }
            upload.in_flight += 1;
            upload.max_in_flight = upload.max_in_flight.max(upload.in_flight);
        }
        let _guard = InFlightGuard {
            inner: self.inner.clone(),
            upload_id: upload_id.to_string(),
        };

        let latency = self.latency();
        if !latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        let injected = self
            .inner
            .chunk_failures
            .lock()
            .get_mut(&index)
            .and_then(|errors| errors.pop_front());
        if let Some(err) = injected {
            return Err(err);
        }

        let checksum = hex::encode(md5::compute(&data).0);
        let mut upload = self.inner.uploads.get_mut(upload_id).ok_or_else(|| {
            UploadError::from_status(404, format!("上传会话不存在: {}", upload_id), None)
        })?;
        if upload.aborted {
            return Err(UploadError::from_status(409, "上传会话已放弃", None));
        }
        let size = data.len() as u64;
        upload.parts.insert(index, data);

        Ok(ChunkReceipt { checksum, size })
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        chunks: &[CompletedChunk],
    ) -> UploadResult<FinalizeResult> {
        if let Some(err) = self.inner.finalize_failures.lock().pop_front() {
            return Err(err);
        }

        let mut upload = self.inner.uploads.get_mut(upload_id).ok_or_else(|| {
            UploadError::from_status(404, format!("上传会话不存在: {}", upload_id), None)
        })?;
        if upload.aborted {
            return Err(UploadError::from_status(409, "上传会话已放弃", None));
        }

        // 分片必须恰好覆盖 0..n 且校验值一致
        let mut object = Vec::with_capacity(upload.metadata.total_size as usize);
        for (expected, chunk) in chunks.iter().enumerate() {
            let part = upload.parts.get(&chunk.index).ok_or_else(|| {
                UploadError::from_status(400, format!("缺少分片 {}", chunk.index), None)
            })?;
            if chunk.index != expected || hex::encode(md5::compute(part).0) != chunk.checksum {
                return Err(UploadError::from_status(
                    400,
                    format!("分片 {} 校验失败", chunk.index),
                    None,
                ));
            }
            object.extend_from_slice(part);
        }
        if chunks.len() != upload.parts.len() || object.len() as u64 != upload.metadata.total_size {
            return Err(UploadError::from_status(400, "分片不完整", None));
        }

        self.close_upload(&mut upload);
        upload.completed = true;
        drop(upload);

        let etag = hex::encode(md5::compute(&object).0);
        self.inner.objects.insert(upload_id.to_string(), object);

        Ok(FinalizeResult {
            location: Some(format!("memory://{}", upload_id)),
            etag: Some(etag),
        })
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> UploadResult<()> {
        let mut upload = self.inner.uploads.get_mut(upload_id).ok_or_else(|| {
            UploadError::from_status(404, format!("上传会话不存在: {}", upload_id), None)
        })?;
        self.close_upload(&mut upload);
        upload.aborted = true;
        upload.parts.clear();
        drop(upload);

        self.inner.aborted.lock().push(upload_id.to_string());
        Ok(())
    }
}
