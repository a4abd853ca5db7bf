//! CloudSync SDK - 离线优先的多设备同步引擎
//!
//! 本地数据库是权威数据源，远端记录存储只做多设备之间的中转：
//! - 📤 本地变更持久化入队，按类型顺序分批上传（父实体总是先于子实体）
//! - 📥 按 change token 增量拉取，版本升序应用，回声抑制
//! - ⚖️ 冲突按 last-writer-wins 判定（含时钟偏差容忍）
//! - ⏳ 父实体缺失的记录进入延迟队列，后续周期重试
//! - 🔄 失败按操作名独立指数退避
//! - 🧹 定期压缩远端历史副本
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cloudsync_sdk::{CloudSyncConfig, CloudSyncSDK, Conversation, InMemoryRemoteStore, LocalChangeType, LocalStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CloudSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .zone_name("CloudSyncZone")
//!         .build();
//!
//!     let sdk = CloudSyncSDK::initialize(config, Arc::new(InMemoryRemoteStore::new())).await?;
//!     sdk.start();
//!
//!     // 本地写入后通知 SDK
//!     let conversation = sdk
//!         .local_store()
//!         .upsert(Conversation::new("Hello", chrono::Utc::now()).into())
//!         .await?;
//!     sdk.record_local_change(&conversation, LocalChangeType::Create).await?;
//!
//!     // 手动触发完整同步
//!     let outcome = sdk.sync_now().await;
//!     println!("同步结果: {:?}", outcome);
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{CloudSyncError, Result};
pub use events::{DataOperation, EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use sdk::{
    CloudSyncConfig, CloudSyncConfigBuilder, CloudSyncSDK, CompactionConfig, EventConfig, QueueConfig, RetryConfig,
    TimingConfig,
};
pub use storage::{
    Attachment, Conversation, KvStore, LocalChangeType, LocalStore, MemoryLocalStore, Message, MessageRole,
    ModelConfig, SqliteLocalStore, SyncEntity,
};
pub use sync::remote::{InMemoryRemoteStore, RemoteError, RemoteStore};
pub use sync::{
    BackgroundOutcome, CycleOutcome, CycleReport, FetchResult, PushSignal, PushTransport, SyncCoordinator,
    SyncPhase, SyncStatus, SyncableKind,
};
pub use utils::{Clock, ManualClock, SystemClock};
pub use version::{version_line, SDK_VERSION};
