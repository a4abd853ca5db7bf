//! 统一 SDK 接口 - CloudSyncSDK 主入口
//!
//! 分层架构：
//! ```text
//! CloudSyncSDK (入口 / 生命周期)
//!   ├── SyncCoordinator (同步编排)
//!   │     └── SyncContext (本地存储、远端、时钟、KV、事件)
//!   ├── EventManager (事件系统层)
//!   └── LifecycleManager (前后台切换)
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{error, info};

use crate::error::{CloudSyncError, Result};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook};
use crate::storage::entities::{LocalChangeType, SyncEntity};
use crate::storage::kv::KvStore;
use crate::storage::local_store::LocalStore;
use crate::storage::sqlite::SqliteLocalStore;
use crate::sync::background::{BackgroundOutcome, FetchResult, PushSignal, PushTransport};
use crate::sync::coordinator::{CycleOutcome, SyncCoordinator};
use crate::sync::remote::RemoteStore;
use crate::sync::{SyncContext, SyncStatus};
use crate::utils::time::{Clock, SystemClock};

/// 本地实体数据库文件名
pub const DATABASE_FILE: &str = "cloudsync.db";
/// KV 目录名
pub const KV_DIR: &str = "kv";

/// CloudSync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 远端分区名
    pub zone_name: String,
    /// 固定设备 ID；None 时使用持久化的随机 ID
    pub device_id: Option<String>,
    /// 调试模式
    pub debug_mode: bool,
    /// 重试配置
    pub retry_config: RetryConfig,
    /// 队列配置
    pub queue_config: QueueConfig,
    /// 压缩配置
    pub compaction_config: CompactionConfig,
    /// 时间相关配置
    pub timing_config: TimingConfig,
    /// 事件配置
    pub event_config: EventConfig,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 每个操作连续重试的上限
    pub max_attempts: u32,
    /// 最大延迟（秒）
    pub max_delay_secs: u64,
    /// 抖动比例（0.2 = 最多额外 20%）
    pub jitter_factor: f64,
    /// 指数退避因子
    pub backoff_factor: f64,
}

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 每次 save_records 的最大记录数
    pub upload_batch_size: usize,
    /// 延迟记录的最大重试次数
    pub deferred_max_retries: u32,
    /// 延迟记录最长保留天数
    pub deferred_max_age_days: i64,
    /// 本地变更入队后自动触发上传
    pub auto_upload_on_change: bool,
}

/// 压缩配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// 只压缩早于该天数的历史
    pub retention_days: i64,
    /// 两次压缩的最小间隔（天）
    pub interval_days: i64,
    pub delete_batch_size: usize,
    pub query_page_size: usize,
}

/// 时间相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// 单次网络调用超时（秒）
    pub network_timeout_secs: u64,
    /// 回声抑制窗口（秒）
    pub echo_window_secs: u64,
    /// 本地变更通知防抖（毫秒）
    pub debounce_ms: u64,
    /// 推送处理总超时（秒）
    pub push_handler_timeout_secs: u64,
    /// 推送到达时若正在上传，先等待的时间（秒）
    pub push_upload_wait_secs: u64,
    /// 首次设置时初始下载的尝试次数
    pub initial_fetch_attempts: u32,
    pub initial_fetch_retry_delay_ms: u64,
    /// 首次设置完成后追加下载的时间点（秒）
    pub post_setup_catch_up_secs: Vec<u64>,
    /// 距上次同步不足该时长时 refresh 走增量
    pub incremental_refresh_window_secs: u64,
    /// 回到前台时距上次同步超过该时长才做完整同步
    pub foreground_sync_after_secs: u64,
    /// 后台窗口内距上次同步超过该时长才下载
    pub background_download_after_secs: u64,
    /// 周期检查间隔（秒）
    pub auto_sync_check_interval_secs: u64,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for CloudSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            zone_name: "CloudSyncZone".to_string(),
            device_id: None,
            debug_mode: false,
            retry_config: RetryConfig::default(),
            queue_config: QueueConfig::default(),
            compaction_config: CompactionConfig::default(),
            timing_config: TimingConfig::default(),
            event_config: EventConfig::default(),
        }
    }
}

/// 获取默认数据目录 ~/.cloudsync/
pub fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".cloudsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows
        home_dir.join(".cloudsync")
    } else {
        PathBuf::from("./cloudsync_data")
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_delay_secs: 300,
            jitter_factor: 0.2,
            backoff_factor: 2.0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            upload_batch_size: 400,
            deferred_max_retries: 10,
            deferred_max_age_days: 7,
            auto_upload_on_change: true,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            interval_days: 7,
            delete_batch_size: 400,
            query_page_size: 200,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            network_timeout_secs: 25,
            echo_window_secs: 30,
            debounce_ms: 500,
            push_handler_timeout_secs: 25,
            push_upload_wait_secs: 5,
            initial_fetch_attempts: 3,
            initial_fetch_retry_delay_ms: 2000,
            post_setup_catch_up_secs: vec![5, 15],
            incremental_refresh_window_secs: 300,
            foreground_sync_after_secs: 60,
            background_download_after_secs: 3600,
            auto_sync_check_interval_secs: 60,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// CloudSync SDK 配置构建器
pub struct CloudSyncConfigBuilder {
    config: CloudSyncConfig,
}

impl CloudSyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CloudSyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn zone_name<S: Into<String>>(mut self, zone: S) -> Self {
        self.config.zone_name = zone.into();
        self
    }

    pub fn device_id<S: Into<String>>(mut self, device_id: S) -> Self {
        self.config.device_id = Some(device_id.into());
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry_config = config;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue_config = config;
        self
    }

    pub fn compaction_config(mut self, config: CompactionConfig) -> Self {
        self.config.compaction_config = config;
        self
    }

    pub fn timing_config(mut self, config: TimingConfig) -> Self {
        self.config.timing_config = config;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn build(self) -> CloudSyncConfig {
        self.config
    }
}

impl Default for CloudSyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudSyncConfig {
    pub fn builder() -> CloudSyncConfigBuilder {
        CloudSyncConfigBuilder::new()
    }
}

/// 统一 SDK 主接口
pub struct CloudSyncSDK {
    config: CloudSyncConfig,

    /// 共享同步上下文
    context: Arc<SyncContext>,

    /// 同步协调器（进程内唯一）
    coordinator: Arc<SyncCoordinator>,

    /// 事件管理器
    event_manager: Arc<EventManager>,

    /// 生命周期管理器
    lifecycle_manager: Arc<RwLock<LifecycleManager>>,

    /// 是否正在关闭
    shutting_down: Arc<RwLock<bool>>,
}

impl CloudSyncSDK {
    /// 异步初始化 SDK
    ///
    /// 本地数据库打不开是唯一的致命错误，直接返回给调用方。
    pub async fn initialize(config: CloudSyncConfig, remote: Arc<dyn RemoteStore>) -> Result<Arc<Self>> {
        info!("正在初始化 CloudSyncSDK... ({})", crate::version::version_line());
        Self::validate_config(&config)?;

        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join(DATABASE_FILE);
        let local = match SqliteLocalStore::open(&db_path).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("❌ 无法打开本地数据库 {}: {}", db_path.display(), e);
                return Err(e);
            }
        };

        Self::initialize_with_store(config, local, remote, Arc::new(SystemClock)).await
    }

    /// 使用外部提供的本地存储与时钟初始化（嵌入方或测试替身）
    pub async fn initialize_with_store(
        config: CloudSyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        Self::validate_config(&config)?;

        // === 第1层：KV 存储 ===
        let kv = Arc::new(KvStore::open(&config.data_dir.join(KV_DIR), &config.zone_name).await?);

        // === 第2层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));

        // === 第3层：同步上下文与协调器 ===
        let context = Arc::new(
            SyncContext::new(config.clone(), local, remote, clock, kv, event_manager.clone()).await?,
        );
        let coordinator = SyncCoordinator::new(context.clone());
        info!("同步协调器初始化完成");

        // === 第4层：生命周期管理器 ===
        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(coordinator.clone())));

        let sdk = Arc::new(Self {
            config,
            context,
            coordinator,
            event_manager,
            lifecycle_manager: Arc::new(RwLock::new(lifecycle)),
            shutting_down: Arc::new(RwLock::new(false)),
        });

        info!("✅ CloudSyncSDK 初始化完成");
        Ok(sdk)
    }

    fn validate_config(config: &CloudSyncConfig) -> Result<()> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(CloudSyncError::Config("数据目录不能为空".to_string()));
        }
        if config.zone_name.is_empty() {
            return Err(CloudSyncError::Config("zone 名称不能为空".to_string()));
        }
        if config.queue_config.upload_batch_size == 0 || config.compaction_config.delete_batch_size == 0 {
            return Err(CloudSyncError::Config("批大小必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 启动周期任务并在后台跑一次启动同步
    pub fn start(&self) {
        self.coordinator.spawn_periodic_tasks();
        self.coordinator.spawn_launch_sync();
        info!("🔄 CloudSyncSDK 已启动");
    }

    /// 关闭 SDK：取消所有后台任务
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 CloudSyncSDK...");
        {
            let mut shutting_down = self.shutting_down.write().await;
            *shutting_down = true;
        }
        self.coordinator.shutdown();
        self.context.kv.flush().await?;
        self.event_manager.clear_listeners().await;
        info!("CloudSyncSDK 关闭完成");
        Ok(())
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().await
    }

    // ========== 本地变更 ==========

    /// 记录一次本地变更并按配置触发上传；返回带 cloud_id 的实体
    pub async fn record_local_change(&self, entity: &SyncEntity, change: LocalChangeType) -> Result<SyncEntity> {
        self.coordinator.record_local_change(entity, change).await
    }

    // ========== 同步触发 ==========

    pub async fn sync_now(&self) -> CycleOutcome {
        self.coordinator.perform_full_sync().await
    }

    pub async fn refresh(&self) -> CycleOutcome {
        self.coordinator.refresh().await
    }

    pub async fn force_resync_recent(&self, window: Duration) -> Result<usize> {
        self.coordinator.force_resync_recent(window).await
    }

    pub async fn handle_push(&self, signal: PushSignal) -> FetchResult {
        self.coordinator.handle_push(signal).await
    }

    pub fn attach_push_transport(&self, transport: Arc<dyn PushTransport>) {
        self.coordinator.spawn_push_listener(transport);
    }

    /// 系统给出的后台执行窗口
    pub async fn run_background_sync(&self, deadline: Duration) -> BackgroundOutcome {
        self.coordinator.run_background_sync(deadline).await
    }

    pub async fn remove_all_subscriptions(&self) -> Result<usize> {
        self.coordinator.remove_all_subscriptions().await
    }

    // ========== 生命周期 ==========

    pub async fn on_app_foreground(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_foreground().await
    }

    pub async fn on_app_background(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_background().await
    }

    // ========== 状态与事件 ==========

    pub fn sync_status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.coordinator.subscribe_status()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_manager.subscribe()
    }

    pub fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.event_manager.subscribe_filtered(filter)
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    pub fn config(&self) -> &CloudSyncConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.context.device_id
    }

    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.context.local
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }
}
