//! WebSocket 消息类型定义

use crate::events::UploadEvent;
use crate::uploader::{QueueStatus, TaskSnapshot};
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 请求状态快照
    RequestSnapshot,
    /// 设置事件过滤
    ///
    /// 取值为事件类别（如 `upload-progress`），`*` 表示全部事件
    Subscribe {
        subscriptions: Vec<String>,
    },
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 上传引擎事件
    Event {
        event: UploadEvent,
        timestamp: i64,
    },
    /// 状态快照
    Snapshot {
        status: QueueStatus,
        uploads: Vec<TaskSnapshot>,
    },
    /// 连接成功
    Connected {
        connection_id: String,
        timestamp: i64,
    },
    /// 错误消息
    Error { code: String, message: String },
    /// 订阅成功
    SubscribeSuccess {
        /// 当前生效的订阅列表
        subscriptions: Vec<String>,
    },
}

impl WsServerMessage {
    /// 创建 Pong 消息
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    /// 创建 Connected 消息
    pub fn connected(connection_id: String) -> Self {
        Self::Connected {
            connection_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 创建事件消息
    pub fn event(event: UploadEvent) -> Self {
        Self::Event {
            event,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parse() {
        let msg: WsClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","subscriptions":["upload-progress"]}"#)
                .unwrap();
        match msg {
            WsClientMessage::Subscribe { subscriptions } => {
                assert_eq!(subscriptions, vec!["upload-progress".to_string()]);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: WsClientMessage = serde_json::from_str(r#"{"type":"request_snapshot"}"#).unwrap();
        assert!(matches!(msg, WsClientMessage::RequestSnapshot));
    }

    #[test]
    fn test_event_message_serialization() {
        let msg = WsServerMessage::event(UploadEvent::UploadPaused {
            task_id: "t-1".to_string(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["type"], "upload-paused");
        assert_eq!(value["event"]["task_id"], "t-1");
    }
}
