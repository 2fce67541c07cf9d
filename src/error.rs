// 上传引擎错误类型
//
// 分类规则：
// - 可重试：网络错误、5xx 服务器错误、超时、429 限流（需按服务端要求退避）
// - 不可重试：4xx 参数错误（429 除外）、鉴权失败、参数校验失败、取消

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// 错误类别（随 upload-error 事件一起下发）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 提交参数不合法
    Validation,
    /// 网络错误
    Network,
    /// 服务器错误（5xx / 429）
    Server,
    /// 客户端错误（4xx，429 除外）
    Client,
    /// 超时
    Timeout,
    /// 已取消
    Cancelled,
    /// 合并分片失败
    Finalize,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Client => "client",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Finalize => "finalize",
        }
    }
}

/// 上传引擎错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 提交参数校验失败（同步返回给调用方）
    #[error("参数校验失败: {0}")]
    Validation(String),

    /// 网络错误（连接失败、DNS、连接被重置等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 服务器错误（5xx 或 429 限流）
    #[error("服务器错误 (HTTP {status}): {message}")]
    Server {
        status: u16,
        message: String,
        /// 服务端要求的最短等待时间（Retry-After）
        retry_after: Option<Duration>,
    },

    /// 客户端错误（4xx，含鉴权失败）
    #[error("请求被拒绝 (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    /// 单次操作超过截止时间
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 任务已取消
    #[error("上传已取消")]
    Cancelled,

    /// 合并分片失败（重试预算耗尽）
    #[error("合并分片失败: {0}")]
    Finalize(String),
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;

impl UploadError {
    /// 根据 HTTP 状态码构造错误
    ///
    /// 429 与 5xx 归为服务器错误（可重试），其余 4xx 归为客户端错误
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 | 500..=599 => UploadError::Server {
                status,
                message,
                retry_after,
            },
            _ => UploadError::Client { status, message },
        }
    }

    /// 错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Validation(_) => ErrorKind::Validation,
            UploadError::Network(_) => ErrorKind::Network,
            UploadError::Server { .. } => ErrorKind::Server,
            UploadError::Client { .. } => ErrorKind::Client,
            UploadError::Timeout(_) => ErrorKind::Timeout,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::Finalize(_) => ErrorKind::Finalize,
        }
    }

    /// 是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Network(_) | UploadError::Server { .. } | UploadError::Timeout(_)
        )
    }

    /// 是否为鉴权失败（401/403）
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, UploadError::Client { status: 401 | 403, .. })
    }

    /// 服务端要求的退避时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            UploadError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            UploadError::from_status(503, "unavailable", None).kind(),
            ErrorKind::Server
        );
        assert_eq!(
            UploadError::from_status(429, "slow down", Some(Duration::from_secs(2))).kind(),
            ErrorKind::Server
        );
        assert_eq!(
            UploadError::from_status(400, "bad part", None).kind(),
            ErrorKind::Client
        );
        assert_eq!(
            UploadError::from_status(403, "forbidden", None).kind(),
            ErrorKind::Client
        );
    }

    #[test]
    fn test_retryable() {
        assert!(UploadError::Network("reset".into()).is_retryable());
        assert!(UploadError::Timeout("60s".into()).is_retryable());
        assert!(UploadError::from_status(500, "oops", None).is_retryable());
        assert!(UploadError::from_status(429, "slow down", None).is_retryable());

        assert!(!UploadError::from_status(404, "no such upload", None).is_retryable());
        assert!(!UploadError::from_status(401, "expired", None).is_retryable());
        assert!(!UploadError::Validation("empty".into()).is_retryable());
        assert!(!UploadError::Cancelled.is_retryable());
        assert!(!UploadError::Finalize("bad".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_and_unauthorized() {
        let err = UploadError::from_status(429, "slow down", Some(Duration::from_secs(3)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(!err.is_unauthorized());

        let err = UploadError::from_status(401, "token expired", None);
        assert!(err.is_unauthorized());
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert_eq!(ErrorKind::Finalize.as_str(), "finalize");
    }
}
