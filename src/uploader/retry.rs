// 重试策略
//
// 指数退避：delay = base * 2^(attempt-1)，叠加 ±jitter 抖动，上限 max_delay。
// 429 带 Retry-After 时至少等待服务端要求的时间（同样不超过 max_delay）。
// 重试预算按操作计：初始化、每个分片、合并各有一份独立预算，
// 任务上报的 retry_count 为各操作重试次数之和。

use crate::config::{QueueConfig, RetryConfig};
use crate::error::{UploadError, UploadResult};
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 默认最大退避延迟
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// 默认抖动比例
pub const DEFAULT_JITTER: f64 = 0.2;

/// 是否应该进行第 `attempt` 次重试（从 1 开始计数）
pub fn should_retry(error: &UploadError, attempt: u32, max_attempts: u32) -> bool {
    error.is_retryable() && attempt <= max_attempts
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_attempts,
        }
    }

    pub fn from_config(queue: &QueueConfig, retry: &RetryConfig) -> Self {
        Self::new(queue.base_retry_delay(), queue.retry_attempts)
            .with_max_delay(retry.max_delay())
            .with_jitter(retry.jitter)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn should_retry(&self, error: &UploadError, attempt: u32) -> bool {
        should_retry(error, attempt, self.max_attempts)
    }

    /// 不含抖动的退避延迟
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// 含抖动的退避延迟
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if self.jitter <= 0.0 || raw.is_zero() {
            return raw;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        raw.mul_f64(factor.max(0.0)).min(self.max_delay)
    }

    /// 针对具体错误的退避延迟（考虑 Retry-After）
    pub fn delay_for(&self, error: &UploadError, attempt: u32) -> Duration {
        let delay = self.next_delay(attempt);
        match error.retry_after() {
            Some(retry_after) => delay.max(retry_after).min(self.max_delay),
            None => delay,
        }
    }
}

/// 单个操作的重试预算
#[derive(Debug, Default)]
pub struct RetryBudget {
    used: AtomicU32,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已消耗的重试次数
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    /// 消耗一次重试，预算不足时返回 None，成功时返回这是第几次重试
    pub fn try_acquire(&self, max_attempts: u32) -> Option<u32> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max_attempts).then_some(used + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }
}

/// 带截止时间和取消的单次操作
pub(crate) async fn guarded<T, F>(
    fut: F,
    timeout: Duration,
    token: &CancellationToken,
) -> UploadResult<T>
where
    F: Future<Output = UploadResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(UploadError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout(format!(
                "操作超过 {}ms 未完成",
                timeout.as_millis()
            ))),
        },
    }
}

/// 重试执行结果
pub(crate) struct RetryOutcome<T> {
    pub result: UploadResult<T>,
    /// 本次操作发生的重试次数
    pub retries: u32,
    /// 最后一次尝试的耗时
    pub elapsed: Duration,
}

/// 按重试策略执行操作，退避等待期间响应取消
pub(crate) async fn run_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    timeout: Duration,
    token: &CancellationToken,
    budget: &RetryBudget,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UploadResult<T>>,
{
    let mut retries = 0u32;
    loop {
        if token.is_cancelled() {
            return RetryOutcome {
                result: Err(UploadError::Cancelled),
                retries,
                elapsed: Duration::ZERO,
            };
        }

        let started = Instant::now();
        let result = guarded(op(), timeout, token).await;
        let elapsed = started.elapsed();

        let error = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    retries,
                    elapsed,
                }
            }
            Err(e) => e,
        };

        let acquired = if policy.should_retry(&error, budget.used() + 1) {
            budget.try_acquire(policy.max_attempts())
        } else {
            None
        };
        let Some(total) = acquired else {
            return RetryOutcome {
                result: Err(error),
                retries,
                elapsed,
            };
        };

        retries += 1;
        let delay = policy.delay_for(&error, retries);
        warn!(
            "{} 失败，{}ms 后重试（第 {}/{} 次）: {}",
            label,
            delay.as_millis(),
            total,
            policy.max_attempts(),
            error
        );

        tokio::select! {
            _ = token.cancelled() => {
                return RetryOutcome {
                    result: Err(UploadError::Cancelled),
                    retries,
                    elapsed,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
