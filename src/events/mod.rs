//! 事件模块
//!
//! - `types.rs`: 上传引擎对外发布的事件类型
//! - `bus.rs`: 进程内事件总线，按事件类别分发给订阅者

mod bus;
mod types;

pub use bus::*;
pub use types::*;
