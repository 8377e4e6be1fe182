//! 发布重试策略（指数退避）

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DeliveryConfig;
use crate::error::{Result, RouteError};

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 发布尝试上限（含首次）
    pub max_attempts: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_delay_ms: config.initial_backoff_ms,
            max_delay_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（attempt 从 0 开始）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// 可取消的退避等待
    pub async fn backoff(&self, cancel: &CancellationToken, attempt: u32) -> Result<()> {
        let delay = self.calculate_delay(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RouteError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(350));
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        let config = DeliveryConfig {
            max_retries: 0,
            ..DeliveryConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }

    #[test]
    fn test_backoff_completes_without_cancel() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        };
        let cancel = CancellationToken::new();
        tokio_test::assert_ok!(tokio_test::block_on(policy.backoff(&cancel, 0)));
    }

    #[tokio::test]
    async fn test_backoff_aborts_on_cancel() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 1.0,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let res = policy.backoff(&cancel, 0).await;
        assert!(matches!(res, Err(RouteError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
