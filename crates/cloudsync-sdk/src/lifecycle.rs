//! SDK 生命周期管理
//!
//! App 前后台切换由宿主通知，这里统一分发给各个 Hook。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{CloudSyncError, Result};

/// 生命周期回调 Hook
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// App 切换到后台时调用
    async fn on_background(&self) -> Result<()>;

    /// App 切换到前台时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 通知所有 Hook：App 切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败不影响后面的 Hook，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 App 切换到后台");
        let mut errors = Vec::new();
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                errors.push(e);
            }
        }
        Self::first_error(errors, "后台")
    }

    /// 通知所有 Hook：App 切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 App 切换到前台");
        let mut errors = Vec::new();
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                errors.push(e);
            }
        }
        Self::first_error(errors, "前台")
    }

    fn first_error(errors: Vec<CloudSyncError>, stage: &str) -> Result<()> {
        let failed = errors.len();
        match errors.into_iter().next() {
            Some(e) => {
                warn!("⚠️ {} 个 Hook {}切换失败", failed, stage);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

// 同步 Hook（SDK 初始化时自动注册）
mod sync_hook;
pub use sync_hook::SyncLifecycleHook;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        foreground: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        async fn on_background(&self) -> Result<()> {
            if self.fail {
                return Err(CloudSyncError::Other("boom".to_string()));
            }
            Ok(())
        }

        async fn on_foreground(&self) -> Result<()> {
            self.foreground.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let failing = Arc::new(CountingHook {
            foreground: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingHook {
            foreground: AtomicUsize::new(0),
            fail: false,
        });
        let mut manager = LifecycleManager::new();
        manager.register_hook(failing.clone());
        manager.register_hook(healthy.clone());
        assert_eq!(manager.hook_count(), 2);

        assert!(manager.notify_background().await.is_err());
        manager.notify_foreground().await.unwrap();
        assert_eq!(failing.foreground.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.foreground.load(Ordering::SeqCst), 1);
    }
}
