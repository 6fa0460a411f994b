use std::time::Duration;

use crate::core::error::DownloadError;

/// 引擎内部的瞬态错误重试策略
///
/// 指数退避加抖动。只覆盖一次传输内部的瞬态失败；
/// 用尽后引擎上报失败状态，由用户显式重试。
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// 抖动因子，避免重试风暴
    pub jitter_factor: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryStrategy {
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, error: &DownloadError, retry_count: usize) -> bool {
        if retry_count >= self.max_retries {
            return false;
        }
        error.is_retryable()
    }

    pub fn get_delay(&self, retry_count: usize) -> Duration {
        let delay_secs =
            self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(retry_count as i32);

        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = delay_secs + jitter;

        // 最小延迟100ms
        let delay = Duration::from_secs_f64(final_delay.max(0.1));
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_respects_limit() {
        let strategy = RetryStrategy::default();
        assert!(strategy.should_retry(&DownloadError::Timeout, 0));
        assert!(strategy.should_retry(&DownloadError::Timeout, 2));
        assert!(!strategy.should_retry(&DownloadError::Timeout, 3));
    }

    #[test]
    fn test_should_retry_only_transient_errors() {
        let strategy = RetryStrategy::default();
        assert!(strategy.should_retry(&DownloadError::ServerError("503".to_string()), 0));
        assert!(!strategy.should_retry(&DownloadError::InvalidUrl("x".to_string()), 0));
        assert!(!strategy.should_retry(&DownloadError::UntaggedTask, 0));
    }

    #[test]
    fn test_delay_backs_off_and_caps() {
        let strategy = RetryStrategy {
            jitter_factor: 0.0,
            ..RetryStrategy::default()
        };
        assert_eq!(strategy.get_delay(0), Duration::from_secs(1));
        assert_eq!(strategy.get_delay(1), Duration::from_secs(2));
        assert_eq!(strategy.get_delay(2), Duration::from_secs(4));
        // 上限封顶
        assert_eq!(strategy.get_delay(10), Duration::from_secs(60));
    }
}
