//! 网络监测模块
//!
//! - `sampler.rs`: 可插拔的网络采样器（平台上报、实测吞吐量）
//! - `monitor.rs`: 网络指标维护、变化检测、并发与分片大小建议

mod monitor;
mod sampler;

pub use monitor::*;
pub use sampler::*;
