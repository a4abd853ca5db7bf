//! 同步模块生命周期 Hook
//!
//! 回到前台补做首次设置或完整同步，进入后台把待上传变更推出去。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::lifecycle::LifecycleHook;
use crate::sync::SyncCoordinator;

pub struct SyncLifecycleHook {
    coordinator: Arc<SyncCoordinator>,
}

impl SyncLifecycleHook {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        if self.coordinator.is_shut_down() {
            return Ok(());
        }
        info!("[Sync Hook] App 切换到后台");
        self.coordinator.handle_app_background().await
    }

    async fn on_foreground(&self) -> Result<()> {
        if self.coordinator.is_shut_down() {
            return Ok(());
        }
        info!("[Sync Hook] App 切换到前台");
        self.coordinator.handle_app_foreground().await
    }
}
