//! 同步协调器（SyncCoordinator）
//!
//! 进程内唯一，编排完整 / 增量周期，是同步状态的唯一写入方。
//!
//! 完整周期：
//! ```text
//! (首次设置) → 确保 zone → 上传全部待上传 → 下载 → 延迟队列 ×2 → 完成 → 更新 last_sync
//! ```
//! 首次设置：
//! ```text
//! 创建 zone → 订阅 → 初始下载（最多 3 次）→ 延迟队列 ×2 → 标记完成 → +5s / +15s 追加下载
//! ```
//!
//! 触发是幂等的：周期进行中再次触发直接丢弃，不排队。
//! 任何阶段失败都转为 `Failed` 并交给 RetryScheduler，不会中止进程。

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::compaction::{CompactionEngine, CompactionReport};
use super::context::{ControlFlag, SyncContext};
use super::deferred::{DeferredDependencyQueue, DeferredReport};
use super::download::{DownloadPipeline, DownloadReport};
use super::remote::RemoteError;
use super::retry::{RetryScheduler, SyncOperation};
use super::subscription::SubscriptionManager;
use super::upload::{UploadQueue, UploadReport};
use super::{SyncPhase, SyncStatus};
use crate::error::{CloudSyncError, Result};
use crate::events::event_builders;
use crate::storage::entities::{LocalChangeType, SyncEntity};

/// 一个周期的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub setup_ran: bool,
    pub uploaded: usize,
    pub upload_dropped: usize,
    pub downloaded: usize,
    pub deferred_applied: usize,
    pub deferred_pending: usize,
}

impl CycleReport {
    fn add_upload(&mut self, upload: &UploadReport) {
        self.uploaded += upload.uploaded;
        self.upload_dropped += upload.dropped;
    }

    fn add_download(&mut self, download: &DownloadReport) {
        self.downloaded += download.changed();
    }

    fn add_deferred(&mut self, deferred: &DeferredReport) {
        self.deferred_applied += deferred.applied;
        self.deferred_pending = deferred.rescheduled;
    }
}

/// 触发一次周期的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// 已有周期在进行，本次丢弃
    AlreadyRunning,
    Failed(String),
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed(_))
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

pub struct SyncCoordinator {
    pub(super) ctx: Arc<SyncContext>,
    pub(super) uploads: UploadQueue,
    pub(super) downloads: DownloadPipeline,
    pub(super) deferred: Arc<DeferredDependencyQueue>,
    pub(super) subscriptions: SubscriptionManager,
    pub(super) compaction: CompactionEngine,
    pub(super) retry: RetryScheduler,
    pub(super) cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(super) weak: Weak<SyncCoordinator>,
}

impl SyncCoordinator {
    pub fn new(ctx: Arc<SyncContext>) -> Arc<Self> {
        let deferred = Arc::new(DeferredDependencyQueue::new(ctx.clone()));
        Arc::new_cyclic(|weak| Self {
            uploads: UploadQueue::new(ctx.clone()),
            downloads: DownloadPipeline::new(ctx.clone(), deferred.clone()),
            subscriptions: SubscriptionManager::new(ctx.clone()),
            compaction: CompactionEngine::new(ctx.clone()),
            retry: RetryScheduler::new(ctx.config.retry_config.clone()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            weak: weak.clone(),
            deferred,
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn status(&self) -> SyncStatus {
        self.ctx.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.ctx.subscribe_status()
    }

    pub fn retry_attempts(&self, operation: SyncOperation) -> u32 {
        self.retry.attempts(operation)
    }

    // ============================================================
    // 周期入口
    // ============================================================

    /// 完整同步；首次设置未完成时先跑首次设置
    pub async fn perform_full_sync(&self) -> CycleOutcome {
        let Some(guard) = self.ctx.try_begin(ControlFlag::FullSync) else {
            debug!("完整同步已在进行中，丢弃本次触发");
            return CycleOutcome::AlreadyRunning;
        };
        info!("🔄 开始完整同步");
        let result = self.run_full_cycle().await;
        let outcome = self.finish_cycle(result, SyncOperation::FullSync).await;
        drop(guard);
        self.ctx.set_status(SyncStatus::Idle).await;
        outcome
    }

    pub async fn perform_first_time_setup(&self) -> CycleOutcome {
        let Some(guard) = self.ctx.try_begin(ControlFlag::FullSync) else {
            debug!("同步进行中，首次设置稍后再试");
            return CycleOutcome::AlreadyRunning;
        };
        let result = self.run_setup().await;
        let outcome = self.finish_cycle(result, SyncOperation::FullSync).await;
        drop(guard);
        self.ctx.set_status(SyncStatus::Idle).await;
        outcome
    }

    /// 增量刷新：有待上传才上传，下载，延迟队列跑一次
    pub async fn perform_incremental_refresh(&self) -> CycleOutcome {
        let Some(guard) = self.ctx.try_begin(ControlFlag::FullSync) else {
            debug!("同步进行中，丢弃增量刷新");
            return CycleOutcome::AlreadyRunning;
        };
        let result = self.run_incremental_cycle().await;
        let outcome = self.finish_cycle(result, SyncOperation::Download).await;
        drop(guard);
        self.ctx.set_status(SyncStatus::Idle).await;
        outcome
    }

    /// 距上次同步不足窗口走增量，否则完整同步
    pub async fn refresh(&self) -> CycleOutcome {
        let window = Duration::from_secs(self.ctx.config.timing_config.incremental_refresh_window_secs);
        match self.ctx.since_last_sync() {
            Some(elapsed) if elapsed < window => self.perform_incremental_refresh().await,
            _ => self.perform_full_sync().await,
        }
    }

    async fn run_full_cycle(&self) -> Result<CycleReport> {
        let mut report = if self.ctx.is_setup_complete().await? {
            CycleReport::default()
        } else {
            self.run_setup().await?
        };

        self.ensure_zone().await?;

        let total = self.uploads.pending_count().await?;
        self.ctx
            .set_status(SyncStatus::Syncing(SyncPhase::Uploading { current: 0, total }))
            .await;
        let upload = self.uploads.upload_pending().await?;
        report.add_upload(&upload);
        self.after_upload(&upload);

        self.ctx
            .set_status(SyncStatus::Syncing(SyncPhase::Downloading { fetched: 0 }))
            .await;
        let download = self.downloads.download_changes().await?;
        if download.zone_reset {
            info!("zone 已重置，重新执行首次设置");
            let setup = self.run_setup().await?;
            report.setup_ran = true;
            report.downloaded += setup.downloaded;
            return Ok(report);
        }
        report.add_download(&download);

        self.ctx.set_status(SyncStatus::Syncing(SyncPhase::Processing)).await;
        for _ in 0..2 {
            let deferred = self.deferred.process_deferred().await?;
            report.add_deferred(&deferred);
        }

        self.ctx.set_last_sync_at(self.ctx.now()).await?;
        self.ctx
            .emit(event_builders::sync_completed(report.uploaded, report.downloaded))
            .await;
        Ok(report)
    }

    async fn run_incremental_cycle(&self) -> Result<CycleReport> {
        if !self.ctx.is_setup_complete().await? {
            let report = self.run_setup().await?;
            return Ok(report);
        }

        let mut report = CycleReport::default();
        let total = self.uploads.pending_count().await?;
        if total > 0 {
            self.ctx
                .set_status(SyncStatus::Syncing(SyncPhase::Uploading { current: 0, total }))
                .await;
            let upload = self.uploads.upload_pending().await?;
            report.add_upload(&upload);
            self.after_upload(&upload);
        }

        self.ctx
            .set_status(SyncStatus::Syncing(SyncPhase::Downloading { fetched: 0 }))
            .await;
        let download = self.downloads.download_changes().await?;
        if download.zone_reset {
            let setup = self.run_setup().await?;
            report.setup_ran = true;
            report.downloaded += setup.downloaded;
            return Ok(report);
        }
        report.add_download(&download);

        self.ctx.set_status(SyncStatus::Syncing(SyncPhase::Processing)).await;
        let deferred = self.deferred.process_deferred().await?;
        report.add_deferred(&deferred);

        self.ctx.set_last_sync_at(self.ctx.now()).await?;
        self.ctx
            .emit(event_builders::sync_completed(report.uploaded, report.downloaded))
            .await;
        Ok(report)
    }

    /// 首次设置（调用方已持有完整同步标志）
    async fn run_setup(&self) -> Result<CycleReport> {
        info!("🔄 开始首次设置");
        self.ctx.set_status(SyncStatus::SettingUp).await;

        self.ensure_zone().await?;
        let subscriptions = self.subscriptions.ensure_subscriptions().await;
        if !subscriptions.is_complete() {
            warn!("⚠️ 推送订阅不完整 {:?}，依赖轮询与手动触发", subscriptions);
        }

        let download = self.initial_download().await?;
        let mut report = CycleReport {
            setup_ran: true,
            ..Default::default()
        };
        report.add_download(&download);

        self.ctx.set_status(SyncStatus::Syncing(SyncPhase::Processing)).await;
        for _ in 0..2 {
            let deferred = self.deferred.process_deferred().await?;
            report.add_deferred(&deferred);
        }

        self.ctx.set_setup_complete(true).await?;
        self.ctx.set_last_sync_at(self.ctx.now()).await?;
        self.ctx.emit(event_builders::setup_completed()).await;
        self.schedule_catch_up();
        info!("✅ 首次设置完成: 下载 {} 条", report.downloaded);
        Ok(report)
    }

    async fn initial_download(&self) -> Result<DownloadReport> {
        let timing = &self.ctx.config.timing_config;
        let attempts = timing.initial_fetch_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.downloads.download_changes().await {
                Ok(report) if report.zone_reset => {
                    info!("初始下载期间 zone 被重置，重新创建");
                    self.ensure_zone().await?;
                }
                Ok(report) => return Ok(report),
                Err(e) => {
                    warn!("⚠️ 初始下载第 {}/{} 次失败: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(timing.initial_fetch_retry_delay_ms)).await;
            }
        }
        Err(last_error.unwrap_or_else(|| CloudSyncError::Other("初始下载未完成".to_string())))
    }

    async fn ensure_zone(&self) -> Result<()> {
        if self.ctx.with_timeout(self.ctx.remote.create_zone(&self.ctx.zone)).await? {
            info!("✅ 已创建远端 zone: {}", self.ctx.zone);
        }
        Ok(())
    }

    /// 发布 Completed / Failed；失败交给重试调度
    async fn finish_cycle(&self, result: Result<CycleReport>, operation: SyncOperation) -> CycleOutcome {
        match result {
            Ok(report) => {
                self.retry.reset(operation);
                self.ctx.set_status(SyncStatus::Completed).await;
                info!(
                    "✅ 同步完成: 上传 {} / 下载 {} / 延迟应用 {}",
                    report.uploaded, report.downloaded, report.deferred_applied
                );
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                warn!("❌ 同步失败: {}", e);
                let message = e.to_string();
                self.ctx
                    .set_status(SyncStatus::Failed { error: message.clone() })
                    .await;
                self.ctx.emit(event_builders::sync_failed(message.clone())).await;
                self.schedule_retry(operation, &e);
                CycleOutcome::Failed(message)
            }
        }
    }

    // ============================================================
    // 本地变更与单向操作
    // ============================================================

    /// 记录本地变更（带防抖），按配置调度一次上传
    pub async fn record_local_change(&self, entity: &SyncEntity, change: LocalChangeType) -> Result<SyncEntity> {
        if !change.is_delete() && !entity.cloud_id().is_empty() {
            let key = format!("{}_{}", entity.kind(), entity.cloud_id());
            if self.ctx.should_debounce(&key) {
                debug!("防抖: {}", key);
                return Ok(entity.clone());
            }
        }
        let entity = self.enqueue_local_change(entity, change).await?;
        if self.ctx.config.queue_config.auto_upload_on_change {
            self.spawn_operation(SyncOperation::Upload, Duration::ZERO);
        }
        Ok(entity)
    }

    /// 只入队，不触发上传
    pub async fn enqueue_local_change(&self, entity: &SyncEntity, change: LocalChangeType) -> Result<SyncEntity> {
        self.uploads.enqueue(entity, change).await
    }

    /// 仅上传
    pub async fn push_pending_changes(&self) -> Result<UploadReport> {
        match self.uploads.upload_pending().await {
            Ok(report) => {
                self.after_upload(&report);
                Ok(report)
            }
            Err(e) => {
                warn!("上传失败: {}", e);
                self.schedule_retry(SyncOperation::Upload, &e);
                Err(e)
            }
        }
    }

    /// 上传结果的后续处理：冲突触发下载对齐，可重试错误进入退避
    fn after_upload(&self, report: &UploadReport) {
        if report.already_running {
            return;
        }
        if report.needs_reconcile() {
            info!("上传遇到远端版本变化，触发下载对齐");
            self.spawn_operation(SyncOperation::Download, Duration::ZERO);
        }
        if let Some(err) = report.retry_error() {
            self.schedule_retry(SyncOperation::Upload, &CloudSyncError::Remote(err.clone()));
        } else if let Some(RemoteError::ZoneNotFound(zone)) = &report.batch_error {
            warn!("⚠️ 上传时 zone {} 不存在，重新执行首次设置", zone);
            let weak = self.weak.clone();
            self.spawn_task(async move {
                if let Some(this) = weak.upgrade() {
                    if let Err(e) = this.ctx.set_setup_complete(false).await {
                        warn!("重置首次设置标志失败: {}", e);
                    }
                    this.run_operation(SyncOperation::FullSync).await;
                }
            });
        } else if report.batch_error.is_none() {
            self.retry.reset(SyncOperation::Upload);
        }
    }

    /// 仅下载 + 延迟队列一次（与完整同步互斥）
    pub async fn sync_remote_changes(&self) -> Result<DownloadReport> {
        let Some(guard) = self.ctx.try_begin(ControlFlag::FullSync) else {
            debug!("同步进行中，跳过下载");
            return Ok(DownloadReport {
                already_running: true,
                ..Default::default()
            });
        };

        self.ctx
            .set_status(SyncStatus::Syncing(SyncPhase::Downloading { fetched: 0 }))
            .await;
        let result = self.download_and_process().await;
        let status = match &result {
            Ok(_) => {
                self.retry.reset(SyncOperation::Download);
                SyncStatus::Completed
            }
            Err(e) => {
                warn!("下载失败: {}", e);
                self.schedule_retry(SyncOperation::Download, e);
                SyncStatus::Failed { error: e.to_string() }
            }
        };
        self.ctx.set_status(status).await;
        drop(guard);
        self.ctx.set_status(SyncStatus::Idle).await;

        if let Ok(report) = &result {
            if report.zone_reset {
                self.spawn_operation(SyncOperation::FullSync, Duration::ZERO);
            }
        }
        result
    }

    async fn download_and_process(&self) -> Result<DownloadReport> {
        let report = self.downloads.download_changes().await?;
        if report.zone_reset {
            return Ok(report);
        }
        self.ctx.set_status(SyncStatus::Syncing(SyncPhase::Processing)).await;
        self.deferred.process_deferred().await?;
        self.ctx.set_last_sync_at(self.ctx.now()).await?;
        Ok(report)
    }

    /// 把窗口内修改过的会话和消息重新入队并调度上传
    pub async fn force_resync_recent(&self, window: Duration) -> Result<usize> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| CloudSyncError::InvalidData(format!("窗口过大: {}", e)))?;
        let count = self.uploads.enqueue_modified_since(self.ctx.now() - window).await?;
        if count > 0 {
            self.spawn_operation(SyncOperation::Upload, Duration::ZERO);
        }
        Ok(count)
    }

    pub async fn perform_compaction(&self) -> Result<CompactionReport> {
        self.compaction.compact().await
    }

    pub async fn remove_all_subscriptions(&self) -> Result<usize> {
        self.subscriptions.remove_all().await
    }

    // ============================================================
    // 异步调度
    // ============================================================

    /// 失败后按退避延迟重新执行；超过上限则放弃
    pub(super) fn schedule_retry(&self, operation: SyncOperation, err: &CloudSyncError) {
        let attempt = self.retry.attempts(operation) + 1;
        match self.retry.next_delay(operation, err) {
            Some(delay) => {
                let event = event_builders::retry_scheduled(operation.as_str(), attempt, delay.as_millis() as u64);
                let ctx = self.ctx.clone();
                self.spawn_task(async move { ctx.emit(event).await });
                self.spawn_operation(operation, delay);
            }
            None => {
                let ctx = self.ctx.clone();
                self.spawn_task(async move { ctx.emit(event_builders::retry_abandoned(operation.as_str())).await });
            }
        }
    }

    /// 首次设置后的追加下载
    fn schedule_catch_up(&self) {
        for secs in self.ctx.config.timing_config.post_setup_catch_up_secs.clone() {
            debug!("{}s 后追加下载", secs);
            self.spawn_operation(SyncOperation::Download, Duration::from_secs(secs));
        }
    }

    /// 延迟后在后台执行一次操作，关闭时取消
    pub(super) fn spawn_operation(&self, operation: SyncOperation, delay: Duration) {
        let weak = self.weak.clone();
        let cancel = self.cancel.clone();
        self.spawn_task(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(this) = weak.upgrade() {
                        this.run_operation(operation).await;
                    }
                }
            }
        });
    }

    fn run_operation(self: Arc<Self>, operation: SyncOperation) -> BoxFuture<'static, ()> {
        async move {
            match operation {
                SyncOperation::Upload => {
                    let _ = self.push_pending_changes().await;
                }
                SyncOperation::Download => {
                    let _ = self.sync_remote_changes().await;
                }
                SyncOperation::FullSync => {
                    self.perform_full_sync().await;
                }
            }
        }
        .boxed()
    }

    pub(super) fn spawn_task<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// 取消全部后台任务
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        info!("同步协调器已停止，取消后台任务 {} 个", tasks.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
