// API处理器模块

pub mod config;
pub mod system;
pub mod upload;

pub use config::*;
pub use system::*;
pub use upload::*;

use crate::error::{ErrorKind, UploadError};
use serde::{Deserialize, Serialize};

/// 统一响应结构
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    /// 消息
    pub message: String,
    /// 数据
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }

    /// 按错误类别生成错误响应
    pub fn from_upload_error(err: &UploadError) -> Self {
        Self::error(error_code(err.kind()), err.to_string())
    }
}

/// 错误类别对应的业务错误码
pub fn error_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Validation => 400,
        ErrorKind::Client => 4001,
        ErrorKind::Network => 5001,
        ErrorKind::Server => 5002,
        ErrorKind::Timeout => 5003,
        ErrorKind::Finalize => 5004,
        ErrorKind::Cancelled => 4999,
    }
}
