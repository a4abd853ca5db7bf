//! 推送订阅管理
//!
//! 保证存在一个数据库级订阅和一个 zone 级订阅。任何一个缺失都不算失败，
//! 同步退化为轮询 / 手动触发。

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::SyncContext;
use super::remote::{Subscription, SubscriptionScope};
use crate::error::Result;

pub const DATABASE_SUBSCRIPTION_ID: &str = "cloudsync-database-subscription";
pub const ZONE_SUBSCRIPTION_ID: &str = "cloudsync-zone-subscription";

/// 订阅现状
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    pub database: bool,
    pub zone: bool,
}

impl SubscriptionState {
    pub fn is_complete(&self) -> bool {
        self.database && self.zone
    }
}

pub struct SubscriptionManager {
    ctx: Arc<SyncContext>,
}

impl SubscriptionManager {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    fn wanted(&self) -> [Subscription; 2] {
        [
            Subscription {
                id: DATABASE_SUBSCRIPTION_ID.to_string(),
                scope: SubscriptionScope::Database,
            },
            Subscription {
                id: ZONE_SUBSCRIPTION_ID.to_string(),
                scope: SubscriptionScope::Zone(self.ctx.zone.clone()),
            },
        ]
    }

    /// 幂等：已存在的订阅不重复注册，失败只记日志
    pub async fn ensure_subscriptions(&self) -> SubscriptionState {
        let existing = match self.ctx.with_timeout(self.ctx.remote.list_subscriptions()).await {
            Ok(list) => list,
            Err(e) => {
                warn!("⚠️ 查询订阅失败，尝试直接注册: {}", e);
                Vec::new()
            }
        };

        let mut state = SubscriptionState::default();
        for wanted in self.wanted() {
            let present = existing.iter().any(|s| s == &wanted);
            let ok = if present {
                debug!("订阅已存在: {}", wanted.id);
                true
            } else {
                match self.ctx.with_timeout(self.ctx.remote.subscribe(wanted.clone())).await {
                    Ok(()) => {
                        info!("✅ 已注册订阅: {}", wanted.id);
                        true
                    }
                    Err(e) => {
                        warn!("⚠️ 注册订阅 {} 失败，退化为轮询: {}", wanted.id, e);
                        false
                    }
                }
            };
            match wanted.scope {
                SubscriptionScope::Database => state.database = ok,
                SubscriptionScope::Zone(_) => state.zone = ok,
            }
        }
        state
    }

    /// 移除本 SDK 注册的订阅，返回移除个数
    pub async fn remove_all(&self) -> Result<usize> {
        let mut removed = 0;
        for wanted in self.wanted() {
            self.ctx.with_timeout(self.ctx.remote.unsubscribe(&wanted.id)).await?;
            removed += 1;
        }
        info!("已移除订阅 {} 个", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::context::test_support::TestHarness;
    use crate::sync::remote::memory::RemoteOp;
    use crate::sync::remote::RemoteError;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let h = TestHarness::new("AAA").await;
        let manager = SubscriptionManager::new(h.ctx.clone());

        assert!(manager.ensure_subscriptions().await.is_complete());
        assert!(manager.ensure_subscriptions().await.is_complete());
        assert_eq!(h.remote.subscriptions().len(), 2);
        assert_eq!(h.remote.call_count(RemoteOp::Subscribe), 2);
    }

    #[tokio::test]
    async fn test_failure_is_tolerated() {
        let h = TestHarness::new("AAA").await;
        let manager = SubscriptionManager::new(h.ctx.clone());
        h.remote.fail_next(RemoteOp::Subscribe, RemoteError::PermissionFailure);

        let state = manager.ensure_subscriptions().await;
        assert!(!state.database);
        assert!(state.zone);

        // 下一次补上缺失的那个
        assert!(manager.ensure_subscriptions().await.is_complete());
    }

    #[tokio::test]
    async fn test_remove_all() {
        let h = TestHarness::new("AAA").await;
        let manager = SubscriptionManager::new(h.ctx.clone());
        manager.ensure_subscriptions().await;
        assert_eq!(manager.remove_all().await.unwrap(), 2);
        assert!(h.remote.subscriptions().is_empty());
    }
}
