// 网络状况采样器
//
// - ReportedNetworkSampler: 宿主平台（移动端桥接、系统网络 API）主动上报
// - ThroughputSampler: 根据分片实测吞吐量推断，所有平台都可用

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 网络有效类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

/// slow-2g 吞吐上限（字节/秒，约 50kbps）
const SLOW_2G_MAX_SPEED: f64 = 6_250.0;
/// 2g 吞吐上限（约 70kbps）
const TWO_G_MAX_SPEED: f64 = 8_750.0;
/// 3g 吞吐上限（约 700kbps）
const THREE_G_MAX_SPEED: f64 = 87_500.0;

const SLOW_2G_MIN_RTT_MS: u64 = 2000;
const TWO_G_MIN_RTT_MS: u64 = 1400;
const THREE_G_MIN_RTT_MS: u64 = 270;

impl EffectiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveType::Slow2g => "slow-2g",
            EffectiveType::TwoG => "2g",
            EffectiveType::ThreeG => "3g",
            EffectiveType::FourG => "4g",
            EffectiveType::Unknown => "unknown",
        }
    }

    /// 解析平台上报的类型字符串，无法识别时返回 Unknown
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "slow-2g" | "slow2g" => EffectiveType::Slow2g,
            "2g" => EffectiveType::TwoG,
            "3g" => EffectiveType::ThreeG,
            "4g" | "5g" | "wifi" | "ethernet" => EffectiveType::FourG,
            _ => EffectiveType::Unknown,
        }
    }

    /// 根据吞吐量和 RTT 推断有效类型
    ///
    /// 任一指标落入更差的档位即取更差的档位
    pub fn from_measurements(speed: Option<f64>, rtt_ms: Option<u64>) -> Self {
        let speed = speed.filter(|s| *s > 0.0);
        if speed.is_none() && rtt_ms.is_none() {
            return EffectiveType::Unknown;
        }

        let by_speed = |limit: f64| speed.map_or(false, |s| s < limit);
        let by_rtt = |limit: u64| rtt_ms.map_or(false, |r| r >= limit);

        if by_speed(SLOW_2G_MAX_SPEED) || by_rtt(SLOW_2G_MIN_RTT_MS) {
            EffectiveType::Slow2g
        } else if by_speed(TWO_G_MAX_SPEED) || by_rtt(TWO_G_MIN_RTT_MS) {
            EffectiveType::TwoG
        } else if by_speed(THREE_G_MAX_SPEED) || by_rtt(THREE_G_MIN_RTT_MS) {
            EffectiveType::ThreeG
        } else {
            EffectiveType::FourG
        }
    }

    /// 该档位的名义吞吐量（字节/秒），Unknown 返回 0
    pub fn nominal_speed(&self) -> f64 {
        match self {
            EffectiveType::Slow2g => 5_000.0,
            EffectiveType::TwoG => 25_000.0,
            EffectiveType::ThreeG => 187_500.0,
            EffectiveType::FourG => 1_250_000.0,
            EffectiveType::Unknown => 0.0,
        }
    }
}

impl fmt::Display for EffectiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次采样结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NetworkSample {
    pub effective_type: Option<EffectiveType>,
    pub rtt_ms: Option<u64>,
    /// 下行/上行带宽估计（字节/秒）
    pub bandwidth: Option<f64>,
}

/// 网络采样器接口
pub trait NetworkSampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// 返回最新采样，没有可用数据时返回 None
    fn sample(&self) -> Option<NetworkSample>;
}

// =====================================================
// 平台上报采样器
// =====================================================

/// 平台上报采样器
///
/// 宿主通过 `report` 推送最新网络状况，监测器在采样周期内读取
#[derive(Debug, Clone, Default)]
pub struct ReportedNetworkSampler {
    latest: Arc<RwLock<Option<NetworkSample>>>,
}

impl ReportedNetworkSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, sample: NetworkSample) {
        *self.latest.write() = Some(sample);
    }

    /// 上报有效类型和 RTT
    pub fn report_type(&self, effective_type: EffectiveType, rtt_ms: Option<u64>) {
        self.report(NetworkSample {
            effective_type: Some(effective_type),
            rtt_ms,
            bandwidth: None,
        });
    }

    pub fn clear(&self) {
        *self.latest.write() = None;
    }
}

impl NetworkSampler for ReportedNetworkSampler {
    fn name(&self) -> &'static str {
        "reported"
    }

    fn sample(&self) -> Option<NetworkSample> {
        *self.latest.read()
    }
}

// =====================================================
// 吞吐量采样器
// =====================================================

struct ThroughputState {
    /// 最近的原始速度样本（字节/秒）
    samples: VecDeque<f64>,
    /// 速度 EMA
    ema: Option<f64>,
}

/// 吞吐量采样器
///
/// 由分片上传完成时的实测耗时驱动，维护原始样本环形缓冲区和 EMA
pub struct ThroughputSampler {
    capacity: usize,
    weight: f64,
    state: Mutex<ThroughputState>,
}

impl ThroughputSampler {
    pub fn new(capacity: usize, weight: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            weight: weight.clamp(0.0, 1.0),
            state: Mutex::new(ThroughputState {
                samples: VecDeque::with_capacity(capacity.max(1)),
                ema: None,
            }),
        }
    }

    /// 记录一次传输
    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if bytes == 0 || secs <= 0.0 {
            return;
        }
        let speed = bytes as f64 / secs;

        let mut state = self.state.lock();
        if state.samples.len() >= self.capacity {
            state.samples.pop_front();
        }
        state.samples.push_back(speed);
        state.ema = Some(match state.ema {
            Some(prev) => self.weight * speed + (1.0 - self.weight) * prev,
            None => speed,
        });
    }

    /// 当前 EMA 速度
    pub fn speed(&self) -> Option<f64> {
        self.state.lock().ema
    }

    /// 原始样本快照
    pub fn samples(&self) -> VecDeque<f64> {
        self.state.lock().samples.clone()
    }
}

impl NetworkSampler for ThroughputSampler {
    fn name(&self) -> &'static str {
        "throughput"
    }

    fn sample(&self) -> Option<NetworkSample> {
        let speed = self.speed()?;
        Some(NetworkSample {
            effective_type: Some(EffectiveType::from_measurements(Some(speed), None)),
            rtt_ms: None,
            bandwidth: Some(speed),
        })
    }
}
