// 网络状况监测器
//
// 周期性采样（优先平台上报，其次实测吞吐量），
// 有效类型变化或速度变化超过阈值时产生一次网络变化通知。

use super::sampler::{EffectiveType, NetworkSampler, ThroughputSampler};
use crate::config::{ChunkConfig, NetworkConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 4g 档位下分片大小下限参考值：5MB
const FOUR_G_BASE_CHUNK: u64 = 5 * 1024 * 1024;
/// 3g 档位分片上限：5MB
const THREE_G_MAX_CHUNK: u64 = 5 * 1024 * 1024;
/// 2g 档位分片上限：1MB
const TWO_G_MAX_CHUNK: u64 = 1024 * 1024;
/// 4g 档位按速度放大分片：每个分片约传输 4 秒
const FOUR_G_CHUNK_SECONDS: f64 = 4.0;
/// 4g 高速档阈值：5MB/s
const FAST_LINK_SPEED: f64 = 5.0 * 1024.0 * 1024.0;

/// 网络指标
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// 速度 EMA（字节/秒）
    pub speed: f64,
    pub rtt_ms: Option<u64>,
    pub effective_type: EffectiveType,
    /// 最近一次测量时间（毫秒时间戳）
    pub last_measured: Option<i64>,
    /// 最近的原始速度样本
    pub samples: VecDeque<f64>,
}

impl NetworkMetrics {
    /// 当前档位的期望吞吐量
    pub fn expected_speed(&self) -> f64 {
        self.effective_type.nominal_speed()
    }
}

/// 并发建议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyRecommendation {
    pub files: usize,
    pub chunks: usize,
}

/// 根据网络状况给出并发建议
///
/// Unknown 按 3g 档位处理
pub fn recommended_concurrency(metrics: &NetworkMetrics) -> ConcurrencyRecommendation {
    let (files, chunks) = match metrics.effective_type {
        EffectiveType::Slow2g | EffectiveType::TwoG => (1, 1),
        EffectiveType::ThreeG | EffectiveType::Unknown => (2, 2),
        EffectiveType::FourG if metrics.speed >= FAST_LINK_SPEED => (4, 6),
        EffectiveType::FourG => (3, 4),
    };
    ConcurrencyRecommendation { files, chunks }
}

/// 根据网络状况给出分片大小建议，结果位于 [min, max] 区间内
pub fn recommended_chunk_size(metrics: &NetworkMetrics, bounds: &ChunkConfig) -> u64 {
    let size = match metrics.effective_type {
        EffectiveType::Slow2g | EffectiveType::TwoG => TWO_G_MAX_CHUNK.min(bounds.max_chunk_size),
        EffectiveType::ThreeG => THREE_G_MAX_CHUNK.min(bounds.max_chunk_size),
        EffectiveType::FourG => {
            let floor = FOUR_G_BASE_CHUNK.min(bounds.max_chunk_size);
            if metrics.speed > 0.0 {
                ((metrics.speed * FOUR_G_CHUNK_SECONDS) as u64)
                    .max(floor)
                    .min(bounds.max_chunk_size)
            } else {
                bounds.max_chunk_size
            }
        }
        EffectiveType::Unknown => bounds.default_chunk_size,
    };
    bounds.clamp(size)
}

/// 网络变化通知
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkChange {
    pub metrics: NetworkMetrics,
    pub previous_type: EffectiveType,
}

struct MonitorState {
    metrics: NetworkMetrics,
    /// 上一次发布变化时的 (类型, 速度)
    published: Option<(EffectiveType, f64)>,
}

/// 网络监测器
pub struct NetworkMonitor {
    config: NetworkConfig,
    platform: Option<Arc<dyn NetworkSampler>>,
    throughput: ThroughputSampler,
    state: Mutex<MonitorState>,
}

impl NetworkMonitor {
    pub fn new(config: NetworkConfig, platform: Option<Arc<dyn NetworkSampler>>) -> Self {
        let throughput = ThroughputSampler::new(config.sample_capacity, config.speed_ema_weight);
        if let Some(p) = &platform {
            info!("网络监测使用平台采样器: {}", p.name());
        }
        Self {
            config,
            platform,
            throughput,
            state: Mutex::new(MonitorState {
                metrics: NetworkMetrics::default(),
                published: None,
            }),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        self.config.sample_interval()
    }

    /// 记录一次分片传输的实测吞吐
    pub fn record_transfer(&self, bytes: u64, elapsed: Duration) {
        self.throughput.record(bytes, elapsed);
    }

    /// 当前网络指标快照
    pub fn metrics(&self) -> NetworkMetrics {
        self.state.lock().metrics.clone()
    }

    /// 执行一次采样
    ///
    /// 返回 Some 表示网络状况发生了需要通知的变化
    pub fn refresh(&self) -> Option<NetworkChange> {
        let platform_sample = self.platform.as_ref().and_then(|p| p.sample());
        let sample = platform_sample.or_else(|| self.throughput.sample())?;

        let measured = self.throughput.speed();
        let speed = measured.or(sample.bandwidth).unwrap_or(0.0);
        let effective_type = sample
            .effective_type
            .unwrap_or_else(|| EffectiveType::from_measurements(Some(speed), sample.rtt_ms));

        let mut state = self.state.lock();
        state.metrics = NetworkMetrics {
            speed,
            rtt_ms: sample.rtt_ms,
            effective_type,
            last_measured: Some(chrono::Utc::now().timestamp_millis()),
            samples: self.throughput.samples(),
        };

        let (previous_type, changed) = match state.published {
            None => (EffectiveType::Unknown, true),
            Some((prev_type, prev_speed)) => (
                prev_type,
                prev_type != effective_type
                    || speed_changed(prev_speed, speed, self.config.change_threshold),
            ),
        };

        if !changed {
            return None;
        }

        state.published = Some((effective_type, speed));
        if previous_type != effective_type {
            info!(
                "网络类型变化: {} -> {} (速度 {:.0} B/s)",
                previous_type, effective_type, speed
            );
        } else {
            debug!("网络速度变化: {:.0} B/s ({})", speed, effective_type);
        }

        Some(NetworkChange {
            metrics: state.metrics.clone(),
            previous_type,
        })
    }
}

fn speed_changed(previous: f64, current: f64, threshold: f64) -> bool {
    if previous <= 0.0 {
        return current > 0.0;
    }
    ((current - previous).abs() / previous) > threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ReportedNetworkSampler;

    fn metrics(effective_type: EffectiveType, speed: f64) -> NetworkMetrics {
        NetworkMetrics {
            speed,
            effective_type,
            ..Default::default()
        }
    }

    #[test]
    fn test_recommended_concurrency_bands() {
        assert_eq!(
            recommended_concurrency(&metrics(EffectiveType::TwoG, 0.0)),
            ConcurrencyRecommendation { files: 1, chunks: 1 }
        );
        assert_eq!(
            recommended_concurrency(&metrics(EffectiveType::Slow2g, 0.0)).files,
            1
        );
        assert_eq!(
            recommended_concurrency(&metrics(EffectiveType::ThreeG, 0.0)),
            ConcurrencyRecommendation { files: 2, chunks: 2 }
        );
        assert_eq!(
            recommended_concurrency(&metrics(EffectiveType::FourG, 1_000_000.0)),
            ConcurrencyRecommendation { files: 3, chunks: 4 }
        );
        assert_eq!(
            recommended_concurrency(&metrics(EffectiveType::FourG, 20_000_000.0)),
            ConcurrencyRecommendation { files: 4, chunks: 6 }
        );
    }

    #[test]
    fn test_recommended_chunk_size_bands() {
        let bounds = ChunkConfig::default();
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::TwoG, 0.0), &bounds),
            1024 * 1024
        );
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::ThreeG, 0.0), &bounds),
            5 * 1024 * 1024
        );
        // 4g 按速度放大，不超过上限
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::FourG, 100_000_000.0), &bounds),
            bounds.max_chunk_size
        );
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::FourG, 1_000.0), &bounds),
            5 * 1024 * 1024
        );
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::Unknown, 0.0), &bounds),
            bounds.default_chunk_size
        );
    }

    #[test]
    fn test_chunk_size_respects_small_bounds() {
        let bounds = ChunkConfig {
            min_chunk_size: 64 * 1024,
            default_chunk_size: 512 * 1024,
            max_chunk_size: 2 * 1024 * 1024,
        };
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::FourG, 0.0), &bounds),
            2 * 1024 * 1024
        );
        assert_eq!(
            recommended_chunk_size(&metrics(EffectiveType::TwoG, 0.0), &bounds),
            1024 * 1024
        );
    }

    #[test]
    fn test_refresh_without_data() {
        let monitor = NetworkMonitor::new(NetworkConfig::default(), None);
        assert!(monitor.refresh().is_none());
        assert_eq!(monitor.metrics().effective_type, EffectiveType::Unknown);
    }

    #[test]
    fn test_refresh_change_detection() {
        let sampler = ReportedNetworkSampler::new();
        let monitor = NetworkMonitor::new(
            NetworkConfig::default(),
            Some(Arc::new(sampler.clone())),
        );

        sampler.report_type(EffectiveType::FourG, Some(50));
        let change = monitor.refresh().unwrap();
        assert_eq!(change.previous_type, EffectiveType::Unknown);
        assert_eq!(change.metrics.effective_type, EffectiveType::FourG);

        // 没有变化
        assert!(monitor.refresh().is_none());

        sampler.report_type(EffectiveType::TwoG, Some(1500));
        let change = monitor.refresh().unwrap();
        assert_eq!(change.previous_type, EffectiveType::FourG);
        assert_eq!(change.metrics.effective_type, EffectiveType::TwoG);
    }

    #[test]
    fn test_speed_change_threshold() {
        let monitor = NetworkMonitor::new(NetworkConfig::default(), None);

        monitor.record_transfer(2_000_000, Duration::from_secs(1));
        assert!(monitor.refresh().is_some());

        // EMA 变化约 3%，低于 20% 阈值
        monitor.record_transfer(2_200_000, Duration::from_secs(1));
        assert!(monitor.refresh().is_none());

        // 大幅下降
        for _ in 0..5 {
            monitor.record_transfer(200_000, Duration::from_secs(1));
        }
        let change = monitor.refresh().unwrap();
        assert!(change.metrics.speed < 1_500_000.0);
        assert!(!change.metrics.samples.is_empty());
    }

    #[test]
    fn test_speed_changed_helper() {
        assert!(speed_changed(0.0, 10.0, 0.2));
        assert!(!speed_changed(0.0, 0.0, 0.2));
        assert!(!speed_changed(100.0, 115.0, 0.2));
        assert!(speed_changed(100.0, 79.0, 0.2));
    }
}
