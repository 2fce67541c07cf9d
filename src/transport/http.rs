// REST 分片上传协议
//
// POST   {base}/uploads                          -> {"upload_id": "..."}
// PUT    {base}/uploads/{id}/parts/{n}           -> ETag（n 从 1 开始）
// POST   {base}/uploads/{id}/complete            -> {"location": "...", "etag": "..."}
// DELETE {base}/uploads/{id}

use super::{ChunkReceipt, FinalizeResult, UploadMetadata, UploadTransport};
use crate::config::TransportConfig;
use crate::error::{UploadError, UploadResult};
use crate::uploader::CompletedChunk;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{HeaderMap, CONTENT_TYPE, ETAG, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct PartResponse {
    #[serde(default)]
    etag: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompletePart<'a> {
    part_number: usize,
    etag: &'a str,
    size: u64,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    parts: Vec<CompletePart<'a>>,
}

/// REST 分片上传客户端
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!("HTTP 上传协议: {}", config.base_url);
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn upload_path(upload_id: &str) -> String {
        format!("uploads/{}", urlencoding::encode(upload_id))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// 发送请求并检查状态码
    async fn send(builder: RequestBuilder) -> UploadResult<Response> {
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_string()
        } else {
            body
        };
        Err(UploadError::from_status(status.as_u16(), message, retry_after))
    }
}

/// 解析 Retry-After（只支持秒数形式）
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn map_reqwest_error(e: reqwest::Error) -> UploadError {
    if e.is_timeout() {
        UploadError::Timeout(e.to_string())
    } else if let Some(status) = e.status() {
        UploadError::from_status(status.as_u16(), e.to_string(), None)
    } else {
        UploadError::Network(e.to_string())
    }
}

fn decode_error(e: impl std::fmt::Display) -> UploadError {
    UploadError::Network(format!("解析响应失败: {}", e))
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn initiate_multipart_upload(&self, metadata: &UploadMetadata) -> UploadResult<String> {
        let response = Self::send(self.request(Method::POST, "uploads").json(metadata)).await?;
        let body: InitiateResponse = response.json().await.map_err(decode_error)?;
        debug!("初始化上传成功: task={}, upload_id={}", metadata.task_id, body.upload_id);
        Ok(body.upload_id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> UploadResult<ChunkReceipt> {
        let digest = md5::compute(&data);
        let size = data.len() as u64;
        let path = format!("{}/parts/{}", Self::upload_path(upload_id), index + 1);
        let builder = self
            .request(Method::PUT, &path)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Content-MD5", STANDARD.encode(digest.0))
            .body(data);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            response = Self::send(builder) => response?,
        };

        let header_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());
        let checksum = match header_etag {
            Some(etag) => etag,
            None => {
                let text = response.text().await.map_err(decode_error)?;
                serde_json::from_str::<PartResponse>(&text)
                    .ok()
                    .and_then(|p| p.etag)
                    .unwrap_or_else(|| hex::encode(digest.0))
            }
        };

        Ok(ChunkReceipt { checksum, size })
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        chunks: &[CompletedChunk],
    ) -> UploadResult<FinalizeResult> {
        let request = CompleteRequest {
            parts: chunks
                .iter()
                .map(|c| CompletePart {
                    part_number: c.index + 1,
                    etag: &c.checksum,
                    size: c.size,
                })
                .collect(),
        };
        let path = format!("{}/complete", Self::upload_path(upload_id));
        let response = Self::send(self.request(Method::POST, &path).json(&request)).await?;

        let text = response.text().await.map_err(decode_error)?;
        if text.trim().is_empty() {
            return Ok(FinalizeResult::default());
        }
        serde_json::from_str(&text).map_err(decode_error)
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> UploadResult<()> {
        let path = Self::upload_path(upload_id);
        Self::send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_url_building() {
        let config = TransportConfig {
            base_url: "https://upload.example.com/v2/".to_string(),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.url("uploads"),
            "https://upload.example.com/v2/uploads"
        );
        assert_eq!(
            transport.url(&HttpTransport::upload_path("a b/c")),
            "https://upload.example.com/v2/uploads/a%20b%2Fc"
        );
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_complete_request_uses_one_based_parts() {
        let chunks = vec![
            CompletedChunk {
                index: 0,
                checksum: "a".into(),
                size: 10,
            },
            CompletedChunk {
                index: 1,
                checksum: "b".into(),
                size: 5,
            },
        ];
        let request = CompleteRequest {
            parts: chunks
                .iter()
                .map(|c| CompletePart {
                    part_number: c.index + 1,
                    etag: &c.checksum,
                    size: c.size,
                })
                .collect(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["parts"][0]["part_number"], 1);
        assert_eq!(json["parts"][1]["etag"], "b");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let config = TransportConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            connect_timeout_ms: 500,
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        let err = transport.abort_multipart_upload("x").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
