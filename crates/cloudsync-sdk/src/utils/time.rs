//! 时间工具模块
//!
//! # 设计原则
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **同步层**: 记录版本号即 `DateTime<Utc>`，由注入的 `Clock` 生成
//! - **测试**: 使用 `ManualClock` 精确控制回声窗口、防抖与延迟队列的过期

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;

/// 时钟抽象，同步引擎所有"现在"都从这里取
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动推进的时钟（测试用）
#[derive(Debug)]
pub struct ManualClock {
    current: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: RwLock::new(start),
        }
    }

    /// 从毫秒时间戳创建
    pub fn at_millis(millis: i64) -> Self {
        Self::new(from_millis(millis))
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.write();
        *current += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

/// 毫秒时间戳 → UTC 时间，越界时回落到 epoch
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// 两个时间的差值（秒，带小数）
pub fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}
