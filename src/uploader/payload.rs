// 上传数据源
//
// 引擎只要求数据源能报告总大小并按字节区间读取，
// 本地文件与内存数据各有一个实现。

use crate::error::{UploadError, UploadResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 可按区间读取的上传数据源
#[async_trait]
pub trait Payload: Send + Sync + Debug {
    /// 总字节数
    fn size(&self) -> u64;

    /// 文件名（用于初始化上传时的元数据）
    fn name(&self) -> Option<&str> {
        None
    }

    fn content_type(&self) -> Option<&str> {
        None
    }

    /// 读取 [start, end) 区间的数据
    async fn read_range(&self, range: Range<u64>) -> UploadResult<Vec<u8>>;
}

pub type PayloadHandle = Arc<dyn Payload>;

/// 根据扩展名推断 MIME 类型
fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("ts") => "video/mp2t",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// 本地文件数据源
#[derive(Debug, Clone)]
pub struct FilePayload {
    path: PathBuf,
    size: u64,
    name: Option<String>,
    content_type: String,
}

impl FilePayload {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("无法读取文件信息: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string());
        let content_type = guess_content_type(&path).to_string();

        Ok(Self {
            size: metadata.len(),
            path,
            name,
            content_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Payload for FilePayload {
    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        Some(&self.content_type)
    }

    async fn read_range(&self, range: Range<u64>) -> UploadResult<Vec<u8>> {
        let path = self.path.clone();
        let len = range.end.saturating_sub(range.start) as usize;

        // 阻塞 IO 放到专用线程
        tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(range.start))?;
            let mut buffer = vec![0u8; len];
            file.read_exact(&mut buffer)?;
            Ok(buffer)
        })
        .await
        .map_err(|e| UploadError::Validation(format!("读取任务异常退出: {}", e)))?
        .map_err(|e| UploadError::Validation(format!("读取文件 {:?} 失败: {}", self.path, e)))
    }
}

/// 内存数据源
#[derive(Debug, Clone)]
pub struct MemoryPayload {
    name: Option<String>,
    data: Arc<Vec<u8>>,
}

impl MemoryPayload {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            name: None,
            data: Arc::new(data),
        }
    }

    pub fn named(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: Some(name.into()),
            data: Arc::new(data),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[async_trait]
impl Payload for MemoryPayload {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    async fn read_range(&self, range: Range<u64>) -> UploadResult<Vec<u8>> {
        let start = range.start as usize;
        let end = range.end as usize;
        if start > end || end > self.data.len() {
            return Err(UploadError::Validation(format!(
                "读取区间越界: {}..{} (总大小 {})",
                start,
                end,
                self.data.len()
            )));
        }
        Ok(self.data[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_file_payload_reads_range() {
        let mut file = tempfile::Builder::new().suffix(".mp4").tempfile().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let payload = FilePayload::open(file.path()).await.unwrap();
        assert_eq!(payload.size(), 10_000);
        assert_eq!(payload.content_type(), Some("video/mp4"));
        assert!(payload.name().unwrap().ends_with(".mp4"));

        let chunk = payload.read_range(1000..2000).await.unwrap();
        assert_eq!(chunk, data[1000..2000].to_vec());
    }

    #[tokio::test]
    async fn test_file_payload_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FilePayload::open(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_file_payload_read_past_end_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        let payload = FilePayload::open(file.path()).await.unwrap();

        let err = payload.read_range(0..10).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
    }

    #[tokio::test]
    async fn test_memory_payload() {
        let payload = MemoryPayload::named("clip.webm", vec![9; 100]);
        assert_eq!(payload.size(), 100);
        assert_eq!(payload.name(), Some("clip.webm"));
        assert_eq!(payload.read_range(90..100).await.unwrap(), vec![9; 10]);
        assert!(payload.read_range(90..101).await.is_err());
    }
}
