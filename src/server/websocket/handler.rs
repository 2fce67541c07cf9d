//! WebSocket 路由处理器

use crate::events::EventKind;
use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 连接级事件过滤，None 表示接收全部事件
type EventFilter = Arc<RwLock<Option<HashSet<EventKind>>>>;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，推送上传引擎事件
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let (mut sender, mut receiver) = socket.split();

    let connected_msg = WsServerMessage::connected(connection_id.clone());
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        if sender.send(Message::Text(json)).await.is_err() {
            error!("发送连接成功消息失败");
            return;
        }
    }

    let (subscription, mut events) = state.coordinator.subscribe_channel(None);
    let filter: EventFilter = Arc::new(RwLock::new(None));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsServerMessage>();

    // 事件转发任务：按连接过滤后放入发送队列
    let forward_filter = filter.clone();
    let forward_tx = out_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let wanted = forward_filter
                .read()
                .as_ref()
                .map_or(true, |kinds| kinds.contains(&event.kind()));
            if wanted && forward_tx.send(WsServerMessage::event(event)).is_err() {
                break;
            }
        }
    });

    // 启动发送任务
    let send_task = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("序列化消息失败: {}", e);
                }
            }
        }
    });

    let state_recv = state.clone();
    let conn_id_recv = connection_id.clone();

    // 启动接收任务
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    handle_client_message(&state_recv, &filter, &out_tx, &text).await;
                }
                Message::Binary(data) => {
                    if let Ok(text) = String::from_utf8(data) {
                        handle_client_message(&state_recv, &filter, &out_tx, &text).await;
                    }
                }
                Message::Close(_) => {
                    debug!("客户端关闭连接: {}", conn_id_recv);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {
            debug!("发送任务结束: {}", connection_id);
        }
        _ = recv_task => {
            debug!("接收任务结束: {}", connection_id);
        }
    }

    subscription.unsubscribe();
    forward_task.abort();
    info!("WebSocket 连接已断开: {}", connection_id);
}

/// 处理客户端消息
async fn handle_client_message(
    state: &AppState,
    filter: &EventFilter,
    out_tx: &mpsc::UnboundedSender<WsServerMessage>,
    text: &str,
) {
    let reply = match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => WsServerMessage::pong(Some(timestamp)),
        Ok(WsClientMessage::RequestSnapshot) => WsServerMessage::Snapshot {
            status: state.coordinator.get_status().await,
            uploads: state.coordinator.list_tasks().await,
        },
        Ok(WsClientMessage::Subscribe { subscriptions }) => {
            match parse_subscriptions(&subscriptions) {
                Ok(kinds) => {
                    let active = match &kinds {
                        Some(set) => set.iter().map(|k| k.as_str().to_string()).collect(),
                        None => vec!["*".to_string()],
                    };
                    *filter.write() = kinds;
                    WsServerMessage::SubscribeSuccess {
                        subscriptions: active,
                    }
                }
                Err(unknown) => {
                    WsServerMessage::error("invalid_subscription", format!("未知事件类别: {}", unknown))
                }
            }
        }
        Err(e) => {
            warn!("无法解析客户端消息: {}", e);
            WsServerMessage::error("invalid_message", e.to_string())
        }
    };
    let _ = out_tx.send(reply);
}

/// 解析订阅列表，包含 `*` 或为空时返回 None（全部事件）
fn parse_subscriptions(subscriptions: &[String]) -> Result<Option<HashSet<EventKind>>, String> {
    if subscriptions.is_empty() || subscriptions.iter().any(|s| s == "*") {
        return Ok(None);
    }
    subscriptions
        .iter()
        .map(|s| EventKind::parse(s).ok_or_else(|| s.clone()))
        .collect::<Result<HashSet<_>, _>>()
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscriptions() {
        assert_eq!(parse_subscriptions(&[]), Ok(None));
        assert_eq!(
            parse_subscriptions(&["upload-progress".to_string(), "*".to_string()]),
            Ok(None)
        );

        let kinds = parse_subscriptions(&[
            "upload-progress".to_string(),
            "queue-empty".to_string(),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&EventKind::UploadProgress));
        assert!(kinds.contains(&EventKind::QueueEmpty));

        assert_eq!(
            parse_subscriptions(&["download".to_string()]),
            Err("download".to_string())
        );
    }
}
