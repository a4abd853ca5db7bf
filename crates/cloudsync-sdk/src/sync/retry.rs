//! 重试调度（RetryScheduler）
//!
//! `delay = min(base(错误类别) × 2^attempt, 300s) + jitter(0–20%)`
//!
//! 计数按操作名独立：上传失败不会阻塞下载重试，反之亦然。
//! 连续 5 次重试后放弃，直到外部再次触发并成功后计数清零。

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::CloudSyncError;
use crate::sdk::RetryConfig;
use crate::sync::remote::RemoteError;

/// 可重试的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOperation {
    Upload,
    Download,
    FullSync,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Upload => "upload",
            SyncOperation::Download => "download",
            SyncOperation::FullSync => "full_sync",
        }
    }
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误类别决定基础延迟
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    ZoneBusy,
    RateLimited(Option<Duration>),
    ServiceUnavailable,
    OtherRetryable,
    NonRetryable,
}

impl ErrorClass {
    pub fn of(err: &CloudSyncError) -> Self {
        match err {
            CloudSyncError::Remote(remote) => match remote {
                RemoteError::NetworkFailure | RemoteError::NetworkUnavailable | RemoteError::Timeout => {
                    ErrorClass::Network
                }
                RemoteError::ZoneBusy => ErrorClass::ZoneBusy,
                RemoteError::RequestRateLimited { .. } => ErrorClass::RateLimited(remote.retry_after()),
                RemoteError::ServiceUnavailable => ErrorClass::ServiceUnavailable,
                other if other.is_retryable() => ErrorClass::OtherRetryable,
                _ => ErrorClass::NonRetryable,
            },
            CloudSyncError::Timeout(_) => ErrorClass::Network,
            e if e.is_retryable() => ErrorClass::OtherRetryable,
            _ => ErrorClass::NonRetryable,
        }
    }

    pub fn base_delay(self) -> Duration {
        match self {
            ErrorClass::Network => Duration::from_secs(5),
            ErrorClass::ZoneBusy => Duration::from_secs(10),
            ErrorClass::RateLimited(retry_after) => retry_after.unwrap_or(Duration::from_secs(30)),
            ErrorClass::ServiceUnavailable => Duration::from_secs(15),
            ErrorClass::OtherRetryable => Duration::from_secs(2),
            ErrorClass::NonRetryable => Duration::from_secs(5),
        }
    }
}

pub struct RetryScheduler {
    config: RetryConfig,
    attempts: Mutex<HashMap<SyncOperation, u32>>,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// 退避延迟（不含抖动）
    pub fn backoff(&self, class: ErrorClass, attempt: u32) -> Duration {
        let base = class.base_delay().as_secs_f64();
        let raw = base * self.config.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.config.max_delay_secs as f64))
    }

    /// 记一次失败并给出下一次重试的延迟；超过上限返回 None 并清除计数
    pub fn next_delay(&self, operation: SyncOperation, err: &CloudSyncError) -> Option<Duration> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let current = attempts.get(&operation).copied().unwrap_or(0);
            if current >= self.config.max_attempts {
                attempts.remove(&operation);
                warn!("⚠️ {} 已连续重试 {} 次，放弃，等待外部触发", operation, current);
                return None;
            }
            attempts.insert(operation, current + 1);
            current
        };

        let backoff = self.backoff(ErrorClass::of(err), attempt);
        let jitter_factor = self.config.jitter_factor.max(0.0);
        let jitter = if jitter_factor > 0.0 {
            backoff.mul_f64(rand::thread_rng().gen_range(0.0..jitter_factor))
        } else {
            Duration::ZERO
        };
        let delay = backoff + jitter;
        debug!(
            "🔄 {} 第 {} 次重试，{}ms 后执行 ({})",
            operation,
            attempt + 1,
            delay.as_millis(),
            err
        );
        Some(delay)
    }

    /// 操作成功：清零
    pub fn reset(&self, operation: SyncOperation) {
        if self.attempts.lock().remove(&operation).is_some() {
            debug!("{} 成功，重试计数清零", operation);
        }
    }

    pub fn attempts(&self, operation: SyncOperation) -> u32 {
        self.attempts.lock().get(&operation).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(RetryConfig::default())
    }

    fn busy() -> CloudSyncError {
        RemoteError::ZoneBusy.into()
    }

    #[test]
    fn test_backoff_is_capped() {
        let s = scheduler();
        assert_eq!(s.backoff(ErrorClass::ZoneBusy, 0), Duration::from_secs(10));
        assert_eq!(s.backoff(ErrorClass::ZoneBusy, 2), Duration::from_secs(40));
        assert_eq!(s.backoff(ErrorClass::RateLimited(None), 4), Duration::from_secs(300));
        assert_eq!(
            s.backoff(ErrorClass::RateLimited(Some(Duration::from_secs(3))), 1),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let s = scheduler();
        for _ in 0..50 {
            s.reset(SyncOperation::Download);
            let delay = s.next_delay(SyncOperation::Download, &busy()).unwrap();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(12));
        }
    }

    #[test]
    fn test_gives_up_after_five_retries() {
        let s = scheduler();
        for _ in 0..5 {
            assert!(s.next_delay(SyncOperation::Upload, &busy()).is_some());
        }
        assert_eq!(s.attempts(SyncOperation::Upload), 5);
        assert!(s.next_delay(SyncOperation::Upload, &busy()).is_none());
        // 放弃后计数清除，外部重新触发可以再次进入退避
        assert_eq!(s.attempts(SyncOperation::Upload), 0);
    }

    #[test]
    fn test_operations_are_independent() {
        let s = scheduler();
        for _ in 0..5 {
            s.next_delay(SyncOperation::Upload, &busy());
        }
        assert!(s.next_delay(SyncOperation::Download, &busy()).is_some());
        assert_eq!(s.attempts(SyncOperation::Download), 1);
        s.reset(SyncOperation::Upload);
        assert_eq!(s.attempts(SyncOperation::Upload), 0);
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(ErrorClass::of(&RemoteError::NetworkFailure.into()), ErrorClass::Network);
        assert_eq!(
            ErrorClass::of(&RemoteError::ServiceUnavailable.into()),
            ErrorClass::ServiceUnavailable
        );
        assert_eq!(
            ErrorClass::of(&CloudSyncError::Other("x".to_string())),
            ErrorClass::NonRetryable
        );
    }
}
