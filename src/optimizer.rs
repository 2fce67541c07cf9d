// 性能优化器
//
// 维护最近完成任务的成功率滑动窗口和平均速度，
// 周期性地调整最优并发文件数和分片大小：
// - 成功率 < 低阈值：并发 -1（不低于 1）
// - 成功率 > 高阈值且实测速度低于网络期望：并发 +1（不超过上限）
// - 实测速度 / 期望速度 < 慢阈值：分片 ×收缩系数（不低于最小分片）
// - 实测速度 / 期望速度 > 快阈值：分片 ×增长系数（不超过最大分片）

use crate::config::{ChunkConfig, OptimizerConfig};
use crate::network::NetworkMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

/// 性能指标
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_uploads: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub cancelled_uploads: u64,
    /// 平均速度 EMA（字节/秒）
    pub average_speed: f64,
    pub total_bytes_uploaded: u64,
    /// 当前活跃任务数
    pub active_concurrency: usize,
    /// 优化器给出的最优并发文件数
    pub optimal_concurrency: usize,
    /// 当前分片大小
    pub chunk_size: u64,
    /// 滑动窗口成功率（窗口为空时为 None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

/// 一次调整的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment {
    pub previous_concurrency: usize,
    pub concurrency: usize,
    pub previous_chunk_size: u64,
    pub chunk_size: u64,
    pub metrics: PerformanceMetrics,
}

impl Adjustment {
    pub fn changed(&self) -> bool {
        self.previous_concurrency != self.concurrency || self.previous_chunk_size != self.chunk_size
    }
}

struct OptimizerState {
    /// 最近完成任务的结果（true = 成功）
    window: VecDeque<bool>,
    metrics: PerformanceMetrics,
}

/// 性能优化器
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    bounds: ChunkConfig,
    state: Mutex<OptimizerState>,
}

impl PerformanceOptimizer {
    pub fn new(config: OptimizerConfig, bounds: ChunkConfig) -> Self {
        let metrics = PerformanceMetrics {
            optimal_concurrency: config.max_concurrency.max(1),
            chunk_size: bounds.default_chunk_size,
            ..Default::default()
        };
        Self {
            state: Mutex::new(OptimizerState {
                window: VecDeque::with_capacity(config.window_size),
                metrics,
            }),
            config,
            bounds,
        }
    }

    pub fn adjust_interval(&self) -> Duration {
        self.config.adjust_interval()
    }

    /// 记录一个任务的最终结果（成功或失败）
    pub fn record_outcome(&self, success: bool) {
        let mut state = self.state.lock();
        if state.window.len() >= self.config.window_size.max(1) {
            state.window.pop_front();
        }
        state.window.push_back(success);

        state.metrics.total_uploads += 1;
        if success {
            state.metrics.successful_uploads += 1;
        } else {
            state.metrics.failed_uploads += 1;
        }
        state.metrics.success_rate = window_rate(&state.window);
    }

    /// 记录一个被取消的任务（不计入成功率窗口）
    pub fn record_cancelled(&self) {
        self.state.lock().metrics.cancelled_uploads += 1;
    }

    /// 记录一次分片传输
    pub fn record_transfer(&self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let mut state = self.state.lock();
        state.metrics.total_bytes_uploaded += bytes;
        if bytes == 0 || secs <= 0.0 {
            return;
        }
        let speed = bytes as f64 / secs;
        let weight = self.config.speed_ema_weight;
        state.metrics.average_speed = if state.metrics.average_speed > 0.0 {
            weight * speed + (1.0 - weight) * state.metrics.average_speed
        } else {
            speed
        };
    }

    pub fn set_active_concurrency(&self, active: usize) {
        self.state.lock().metrics.active_concurrency = active;
    }

    pub fn optimal_concurrency(&self) -> usize {
        self.state.lock().metrics.optimal_concurrency
    }

    pub fn chunk_size(&self) -> u64 {
        self.state.lock().metrics.chunk_size
    }

    /// 直接设置分片大小（网络变化时使用），结果限制在边界内
    pub fn set_chunk_size(&self, size: u64) {
        let size = self.bounds.clamp(size);
        let mut state = self.state.lock();
        if state.metrics.chunk_size != size {
            debug!("分片大小设置: {} -> {}", state.metrics.chunk_size, size);
            state.metrics.chunk_size = size;
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        self.state.lock().metrics.success_rate
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.state.lock().metrics.clone()
    }

    /// 执行一次调整
    ///
    /// `max_files` 为队列配置中的最大并发文件数，并发上限取其与优化器上限的较小值；
    /// `chunk_ceiling` 为网络档位给出的分片上限（启用网络优化时），增长不会越过该值
    pub fn adjust(
        &self,
        network: &NetworkMetrics,
        max_files: usize,
        chunk_ceiling: Option<u64>,
    ) -> Adjustment {
        let ceiling = self.config.max_concurrency.min(max_files).max(1);
        let expected = network.expected_speed();

        let mut state = self.state.lock();
        let previous_concurrency = state.metrics.optimal_concurrency;
        let previous_chunk_size = state.metrics.chunk_size;
        let measured = state.metrics.average_speed;

        // 并发调整
        let mut concurrency = previous_concurrency;
        if let Some(rate) = state.metrics.success_rate {
            if rate < self.config.low_success_rate {
                concurrency = concurrency.saturating_sub(1).max(1);
            } else if rate > self.config.high_success_rate && expected > 0.0 && measured < expected
            {
                concurrency += 1;
            }
        }
        let concurrency = concurrency.clamp(1, ceiling);

        // 分片大小调整
        let mut chunk_size = previous_chunk_size;
        if expected > 0.0 && measured > 0.0 {
            let ratio = measured / expected;
            if ratio < self.config.slow_speed_ratio {
                chunk_size = (chunk_size as f64 * self.config.shrink_factor) as u64;
            } else if ratio > self.config.fast_speed_ratio {
                chunk_size = (chunk_size as f64 * self.config.grow_factor) as u64;
            }
        }
        let mut chunk_size = self.bounds.clamp(chunk_size);
        if let Some(ceiling) = chunk_ceiling {
            chunk_size = chunk_size.min(self.bounds.clamp(ceiling));
        }

        state.metrics.optimal_concurrency = concurrency;
        state.metrics.chunk_size = chunk_size;

        if concurrency != previous_concurrency {
            info!(
                "🔧 动态调整最优并发数: {} -> {}",
                previous_concurrency, concurrency
            );
        }
        if chunk_size != previous_chunk_size {
            info!("🔧 动态调整分片大小: {} -> {}", previous_chunk_size, chunk_size);
        }

        Adjustment {
            previous_concurrency,
            concurrency,
            previous_chunk_size,
            chunk_size,
            metrics: state.metrics.clone(),
        }
    }
}

fn window_rate(window: &VecDeque<bool>) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let ok = window.iter().filter(|s| **s).count();
    Some(ok as f64 / window.len() as f64)
}
