//! 同步模块 - 离线优先的多设备同步引擎
//!
//! 组件（依赖顺序，叶子在前）：
//! - `entity_sync`：类型枚举、change token 存储、payload 与按类型分发表
//! - `conflict`：冲突判定（纯函数）
//! - `upload`：待上传队列的入队与分批推送
//! - `download`：增量拉取、排序、应用、删除
//! - `deferred`：父实体缺失记录的延迟处理
//! - `subscription`：推送订阅
//! - `retry`：按操作名的指数退避
//! - `compaction`：远端历史压缩
//! - `coordinator`：编排完整 / 增量周期，持有唯一的同步状态
//! - `background`：推送、后台窗口与周期任务

pub mod background;
pub mod compaction;
pub mod conflict;
pub mod context;
pub mod coordinator;
pub mod deferred;
pub mod download;
pub mod entity_sync;
pub mod record;
pub mod remote;
pub mod retry;
pub mod subscription;
pub mod upload;

#[cfg(test)]
mod tests;

pub use background::{BackgroundOutcome, FetchResult, PushSignal, PushTransport};
pub use compaction::{CompactionEngine, CompactionReport};
pub use conflict::Resolution;
pub use context::SyncContext;
pub use coordinator::{CycleOutcome, CycleReport, SyncCoordinator};
pub use deferred::{DeferredDependencyQueue, DeferredReport};
pub use download::{DownloadPipeline, DownloadReport};
pub use entity_sync::SyncableKind;
pub use record::{RemoteRecord, SyncRecord};
pub use retry::{RetryScheduler, SyncOperation};
pub use subscription::{SubscriptionManager, SubscriptionState};
pub use upload::{UploadQueue, UploadReport};

use serde::{Deserialize, Serialize};

/// 同步阶段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Uploading { current: usize, total: usize },
    Downloading { fetched: usize },
    Processing,
}

/// 同步状态（协调器是唯一的写入方）
///
/// `Idle → SettingUp → Syncing{..} → {Completed, Failed} → Idle`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Idle,
    SettingUp,
    Syncing(SyncPhase),
    Completed,
    Failed { error: String },
}

impl SyncStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, SyncStatus::SettingUp | SyncStatus::Syncing(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::SettingUp => "setting_up",
            SyncStatus::Syncing(SyncPhase::Uploading { .. }) => "uploading",
            SyncStatus::Syncing(SyncPhase::Downloading { .. }) => "downloading",
            SyncStatus::Syncing(SyncPhase::Processing) => "processing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed { .. } => "failed",
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Idle
    }
}
