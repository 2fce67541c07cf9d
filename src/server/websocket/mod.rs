//! WebSocket 模块
//!
//! 向控制面客户端实时推送上传引擎事件

mod handler;
mod message;

pub use handler::handle_websocket;
pub use message::{WsClientMessage, WsServerMessage};
