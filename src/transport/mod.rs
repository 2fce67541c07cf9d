//! 分片上传协议
//!
//! 引擎只依赖 `UploadTransport` 的四个操作，具体协议可替换：
//! - `http.rs`: REST 分片上传协议（reqwest）
//! - `memory.rs`: 进程内实现，支持延迟与故障注入

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::InMemoryTransport;

use crate::error::UploadResult;
use crate::uploader::{CompletedChunk, SessionContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// 初始化上传时提交的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub total_size: u64,
    /// 初始分片大小（仅供服务端参考，后续分片大小可能变化）
    pub chunk_size: u64,
    pub session: SessionContext,
}

/// 分片上传回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    /// 服务端校验值（ETag）
    pub checksum: String,
    /// 服务端确认接收的字节数
    pub size: u64,
}

/// 合并结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResult {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

/// 分片上传协议
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 初始化分片上传，返回远端上传会话 ID
    async fn initiate_multipart_upload(&self, metadata: &UploadMetadata) -> UploadResult<String>;

    /// 上传单个分片
    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> UploadResult<ChunkReceipt>;

    /// 按索引顺序提交全部分片，完成上传
    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        chunks: &[CompletedChunk],
    ) -> UploadResult<FinalizeResult>;

    /// 放弃上传，释放远端已上传的分片
    async fn abort_multipart_upload(&self, upload_id: &str) -> UploadResult<()>;
}
