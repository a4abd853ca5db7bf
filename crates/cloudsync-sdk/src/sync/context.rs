//! 同步上下文
//!
//! 替代全局单例：所有组件共享的依赖（本地存储、远端、时钟、KV、事件）
//! 以及唯一的一块可变控制状态都挂在这里，进程内构造一次，按引用传递。
//!
//! 控制状态（两个进行中标志、近期上传缓存、防抖时间戳等）只在
//! `control` 互斥锁内读改写，临界区里不做任何 await。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::entity_sync::{ChangeTokenStore, EchoFilter};
use super::remote::{RemoteError, RemoteResult, RemoteStore, ZoneId};
use super::SyncStatus;
use crate::error::Result;
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::sdk::CloudSyncConfig;
use crate::storage::kv::KvStore;
use crate::storage::local_store::LocalStore;
use crate::storage::queue::{DeferredRecordStore, LuidGenerator, PendingUploadStore};
use crate::utils::time::Clock;

const DEVICE_ID_KEY: &str = "device_id";
const SETUP_COMPLETE_KEY: &str = "setup_complete";
const LAST_SYNC_KEY: &str = "last_sync_at";

/// 互斥标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    FullSync,
    Upload,
}

#[derive(Debug, Default)]
struct ControlState {
    full_sync_in_progress: bool,
    upload_in_progress: bool,
    /// cloud_id → 本机上传确认时间
    recent_uploads: HashMap<String, DateTime<Utc>>,
    /// 防抖键 → 最近一次触发时间
    last_trigger: HashMap<String, DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
    /// 累计写入本地的远端变更数（推送处理用作指纹）
    applied_changes: u64,
}

impl ControlState {
    fn flag_mut(&mut self, flag: ControlFlag) -> &mut bool {
        match flag {
            ControlFlag::FullSync => &mut self.full_sync_in_progress,
            ControlFlag::Upload => &mut self.upload_in_progress,
        }
    }
}

/// 标志守卫，drop 时释放
pub struct FlagGuard<'a> {
    ctx: &'a SyncContext,
    flag: ControlFlag,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        *self.ctx.control.lock().flag_mut(self.flag) = false;
        debug!("释放同步标志 {:?}", self.flag);
    }
}

pub struct SyncContext {
    pub config: CloudSyncConfig,
    pub device_id: String,
    pub zone: ZoneId,
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub clock: Arc<dyn Clock>,
    pub kv: Arc<KvStore>,
    pub events: Arc<EventManager>,
    pub tokens: ChangeTokenStore,
    pub pending: PendingUploadStore,
    pub deferred_store: DeferredRecordStore,
    control: Mutex<ControlState>,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncContext {
    pub async fn new(
        config: CloudSyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        kv: Arc<KvStore>,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let device_id = Self::load_device_id(&config, &kv).await?;
        let last_sync_at: Option<DateTime<Utc>> = kv.get(LAST_SYNC_KEY).await?;
        let luids = Arc::new(LuidGenerator::new()?);
        let (status_tx, _) = watch::channel(SyncStatus::Idle);

        info!("✅ 同步上下文已创建: device_id={}, zone={}", device_id, config.zone_name);

        Ok(Self {
            zone: config.zone_name.clone(),
            device_id,
            tokens: ChangeTokenStore::new(kv.clone()),
            pending: PendingUploadStore::new(kv.clone(), luids),
            deferred_store: DeferredRecordStore::new(kv.clone()),
            control: Mutex::new(ControlState {
                last_sync_at,
                ..Default::default()
            }),
            status_tx,
            config,
            local,
            remote,
            clock,
            kv,
            events,
        })
    }

    /// 配置优先，其次 KV 中持久化的 ID，都没有则生成并保存
    async fn load_device_id(config: &CloudSyncConfig, kv: &KvStore) -> Result<String> {
        if let Some(id) = config.device_id.as_ref().filter(|id| !id.is_empty()) {
            kv.set(DEVICE_ID_KEY, id).await?;
            return Ok(id.clone());
        }
        if let Some(id) = kv.get::<_, String>(DEVICE_ID_KEY).await? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        kv.set(DEVICE_ID_KEY, &id).await?;
        info!("生成新的设备 ID: {}", id);
        Ok(id)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ============================================================
    // 互斥标志
    // ============================================================

    /// 检查并置位；已在进行中时返回 None
    pub fn try_begin(&self, flag: ControlFlag) -> Option<FlagGuard<'_>> {
        let mut control = self.control.lock();
        let slot = control.flag_mut(flag);
        if *slot {
            return None;
        }
        *slot = true;
        Some(FlagGuard { ctx: self, flag })
    }

    pub fn is_running(&self, flag: ControlFlag) -> bool {
        *self.control.lock().flag_mut(flag)
    }

    pub fn any_running(&self) -> bool {
        let control = self.control.lock();
        control.full_sync_in_progress || control.upload_in_progress
    }

    // ============================================================
    // 近期上传（回声抑制）与防抖
    // ============================================================

    fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.timing_config.echo_window_secs as i64)
    }

    /// 记录本机刚上传的 cloud_id，顺带清理过期条目
    pub fn mark_uploaded<'a>(&self, cloud_ids: impl IntoIterator<Item = &'a str>) {
        let now = self.now();
        let window = self.echo_window();
        let mut control = self.control.lock();
        control.recent_uploads.retain(|_, at| now - *at < window);
        for cloud_id in cloud_ids {
            control.recent_uploads.insert(cloud_id.to_string(), now);
        }
    }

    /// 同一对象在防抖间隔内的重复通知返回 true
    pub fn should_debounce(&self, key: &str) -> bool {
        let now = self.now();
        let interval = chrono::Duration::milliseconds(self.config.timing_config.debounce_ms as i64);
        let mut control = self.control.lock();
        control.last_trigger.retain(|_, at| now - *at < interval);
        if control.last_trigger.contains_key(key) {
            return true;
        }
        control.last_trigger.insert(key.to_string(), now);
        false
    }

    // ============================================================
    // 统计 / 时间戳
    // ============================================================

    pub fn record_applied(&self, count: usize) {
        self.control.lock().applied_changes += count as u64;
    }

    pub fn applied_changes(&self) -> u64 {
        self.control.lock().applied_changes
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.control.lock().last_sync_at
    }

    pub async fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.control.lock().last_sync_at = Some(at);
        self.kv.set(LAST_SYNC_KEY, &at).await
    }

    /// 距上次成功同步的时长；从未同步过返回 None
    pub fn since_last_sync(&self) -> Option<Duration> {
        self.last_sync_at()
            .and_then(|at| (self.now() - at).to_std().ok())
    }

    pub async fn is_setup_complete(&self) -> Result<bool> {
        Ok(self.kv.get::<_, bool>(SETUP_COMPLETE_KEY).await?.unwrap_or(false))
    }

    pub async fn set_setup_complete(&self, complete: bool) -> Result<()> {
        self.kv.set(SETUP_COMPLETE_KEY, &complete).await
    }

    // ============================================================
    // 状态 / 事件
    // ============================================================

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub async fn set_status(&self, status: SyncStatus) {
        let previous = self.status_tx.send_replace(status.clone());
        if previous != status {
            debug!("同步状态: {} → {}", previous.as_str(), status.as_str());
            self.events.emit(event_builders::status_changed(status)).await;
        }
    }

    pub async fn emit(&self, event: SyncEvent) {
        self.events.emit(event).await;
    }

    // ============================================================
    // 网络超时
    // ============================================================

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.config.timing_config.network_timeout_secs)
    }

    /// 远端调用统一加超时
    pub async fn with_timeout<T, F>(&self, fut: F) -> RemoteResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        match tokio::time::timeout(self.network_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }
}

impl EchoFilter for SyncContext {
    fn was_recently_uploaded(&self, cloud_id: &str) -> bool {
        let now = self.now();
        let window = self.echo_window();
        self.control
            .lock()
            .recent_uploads
            .get(cloud_id)
            .map(|at| now - *at < window)
            .unwrap_or(false)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TestHarness;
    use super::*;

    #[tokio::test]
    async fn test_flags_are_exclusive() {
        let h = TestHarness::new("AAA").await;
        let guard = h.ctx.try_begin(ControlFlag::FullSync);
        assert!(guard.is_some());
        assert!(h.ctx.try_begin(ControlFlag::FullSync).is_none());
        // 两个标志互不影响
        assert!(h.ctx.try_begin(ControlFlag::Upload).is_some());
        drop(guard);
        assert!(!h.ctx.is_running(ControlFlag::FullSync));
        assert!(h.ctx.try_begin(ControlFlag::FullSync).is_some());
    }

    #[tokio::test]
    async fn test_recent_upload_window() {
        let h = TestHarness::new("AAA").await;
        h.ctx.mark_uploaded(["c1"]);
        assert!(h.ctx.was_recently_uploaded("c1"));
        assert!(!h.ctx.was_recently_uploaded("c2"));

        h.clock.advance(chrono::Duration::seconds(31));
        assert!(!h.ctx.was_recently_uploaded("c1"));
    }

    #[tokio::test]
    async fn test_debounce() {
        let h = TestHarness::new("AAA").await;
        assert!(!h.ctx.should_debounce("conversation_c1"));
        assert!(h.ctx.should_debounce("conversation_c1"));
        assert!(!h.ctx.should_debounce("conversation_c2"));
        h.clock.advance(chrono::Duration::milliseconds(600));
        assert!(!h.ctx.should_debounce("conversation_c1"));
    }

    #[tokio::test]
    async fn test_device_id_is_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let kv = KvStore::open(dir.path(), "zone").await.unwrap();
        let config = CloudSyncConfig::default();
        let first = SyncContext::load_device_id(&config, &kv).await.unwrap();
        let second = SyncContext::load_device_id(&config, &kv).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}
