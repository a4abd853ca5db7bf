//! 推送、后台窗口与周期任务
//!
//! 这些入口都挂在 `SyncCoordinator` 上，复用它的互斥标志与重试调度。

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ControlFlag;
use super::coordinator::SyncCoordinator;
use super::remote::{RemoteError, ZoneId};
use super::retry::SyncOperation;
use super::SyncStatus;
use crate::error::{CloudSyncError, Result};

/// 推送唤醒信号（内容不透明，只用来触发一次拉取）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    Database,
    Zone(ZoneId),
    Query(String),
}

/// 推送处理结果（交还给系统的后台拉取回调）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    NewData,
    NoData,
    Failed,
}

/// 推送通道
pub trait PushTransport: Send + Sync {
    fn signals(&self) -> BoxStream<'static, PushSignal>;
}

/// 一次后台窗口的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackgroundOutcome {
    /// 全部步骤在截止时间前完成
    pub completed: bool,
    pub expired: bool,
    pub uploaded: usize,
    pub downloaded: usize,
    pub swept: usize,
    pub compacted: bool,
}

impl SyncCoordinator {
    // ============================================================
    // 推送
    // ============================================================

    /// 处理一次推送唤醒
    ///
    /// 完整同步进行中直接返回 NoData；上传进行中先等一会儿再拉取。
    /// 是否有新数据按已应用变更计数前后对比判断。
    pub async fn handle_push(&self, signal: PushSignal) -> FetchResult {
        debug!("收到推送: {:?}", signal);
        if self.ctx.is_running(ControlFlag::FullSync) {
            debug!("完整同步进行中，忽略推送");
            return FetchResult::NoData;
        }
        if self.ctx.is_running(ControlFlag::Upload) {
            let wait = Duration::from_secs(self.ctx.config.timing_config.push_upload_wait_secs);
            debug!("上传进行中，等待 {:?} 后拉取", wait);
            tokio::time::sleep(wait).await;
        }

        let before = self.ctx.applied_changes();
        let limit = Duration::from_secs(self.ctx.config.timing_config.push_handler_timeout_secs);
        match tokio::time::timeout(limit, self.sync_remote_changes()).await {
            Ok(Ok(report)) if report.already_running => FetchResult::NoData,
            Ok(Ok(_)) => {
                if self.ctx.applied_changes() > before {
                    info!("✅ 推送拉取到新数据");
                    FetchResult::NewData
                } else {
                    FetchResult::NoData
                }
            }
            Ok(Err(e)) => {
                warn!("⚠️ 推送拉取失败: {}", e);
                FetchResult::Failed
            }
            Err(_) => {
                warn!("⚠️ 推送处理超时 ({:?})", limit);
                if !self.ctx.any_running() {
                    self.ctx.set_status(SyncStatus::Idle).await;
                }
                self.schedule_retry(
                    SyncOperation::Download,
                    &CloudSyncError::Remote(RemoteError::Timeout),
                );
                FetchResult::Failed
            }
        }
    }

    /// 订阅推送通道，每个信号处理一次
    pub fn spawn_push_listener(&self, transport: Arc<dyn PushTransport>) {
        let weak = self.weak.clone();
        let cancel = self.cancel.clone();
        self.spawn_task(async move {
            let mut signals = transport.signals();
            info!("推送监听已启动");
            loop {
                let signal = tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = signals.next() => signal,
                };
                let Some(signal) = signal else {
                    debug!("推送通道已关闭");
                    break;
                };
                let Some(this) = weak.upgrade() else { break };
                let result = this.handle_push(signal).await;
                debug!("推送处理结果: {:?}", result);
            }
        });
    }

    // ============================================================
    // 后台执行窗口
    // ============================================================

    /// 在系统给出的窗口内执行：上传、按需下载、清理延迟队列、按需压缩
    ///
    /// 到达截止时间时取消进行中的步骤，已完成的部分计入结果。
    pub async fn run_background_sync(&self, deadline: Duration) -> BackgroundOutcome {
        info!("🔄 后台窗口开始，截止 {:?}", deadline);
        let token = self.cancel.child_token();
        let progress = Mutex::new(BackgroundOutcome::default());

        let expired = tokio::select! {
            _ = self.background_work(&token, &progress) => false,
            _ = tokio::time::sleep(deadline) => true,
            _ = token.cancelled() => true,
        };
        token.cancel();

        let mut outcome = progress.into_inner();
        outcome.expired = expired || outcome.expired;
        outcome.completed = !outcome.expired;
        if outcome.expired {
            warn!("⏸️ 后台窗口到期，未完成的步骤已取消");
            if !self.ctx.any_running() {
                self.ctx.set_status(SyncStatus::Idle).await;
            }
        } else {
            info!(
                "✅ 后台窗口完成: 上传 {} / 下载 {}",
                outcome.uploaded, outcome.downloaded
            );
        }
        outcome
    }

    async fn background_work(&self, token: &CancellationToken, progress: &Mutex<BackgroundOutcome>) {
        match self.push_pending_changes().await {
            Ok(report) => progress.lock().uploaded = report.uploaded,
            Err(e) => warn!("后台上传失败: {}", e),
        }
        if token.is_cancelled() {
            return;
        }

        let threshold = Duration::from_secs(self.ctx.config.timing_config.background_download_after_secs);
        let stale = self.ctx.since_last_sync().map(|d| d >= threshold).unwrap_or(true);
        if stale {
            match self.sync_remote_changes().await {
                Ok(report) => progress.lock().downloaded = report.changed(),
                Err(e) => warn!("后台下载失败: {}", e),
            }
        } else {
            debug!("距上次同步不足 {:?}，后台跳过下载", threshold);
        }
        if token.is_cancelled() {
            return;
        }

        match self.deferred.sweep_expired().await {
            Ok(swept) => progress.lock().swept = swept,
            Err(e) => warn!("清理延迟队列失败: {}", e),
        }
        if token.is_cancelled() {
            return;
        }

        match self.compaction.compact_if_due().await {
            Ok(report) => progress.lock().compacted = report.is_some(),
            Err(e) => warn!("后台压缩失败: {}", e),
        }
    }

    // ============================================================
    // 前后台切换
    // ============================================================

    /// 回到前台：首次设置未完成则补做，否则距上次同步足够久时完整同步
    pub async fn handle_app_foreground(&self) -> Result<()> {
        if !self.ctx.is_setup_complete().await? {
            info!("回到前台，首次设置尚未完成");
            self.perform_first_time_setup().await;
            return Ok(());
        }
        let threshold = Duration::from_secs(self.ctx.config.timing_config.foreground_sync_after_secs);
        match self.ctx.since_last_sync() {
            Some(elapsed) if elapsed < threshold => {
                debug!("距上次同步 {:?}，回到前台不触发同步", elapsed);
            }
            _ => {
                info!("回到前台，触发完整同步");
                self.perform_full_sync().await;
            }
        }
        Ok(())
    }

    /// 进入后台：把待上传的变更推出去
    pub async fn handle_app_background(&self) -> Result<()> {
        if self.uploads.pending_count().await? == 0 {
            return Ok(());
        }
        info!("进入后台，推送待上传变更");
        if let Err(e) = self.push_pending_changes().await {
            warn!("⚠️ 进入后台时上传失败: {}", e);
        }
        Ok(())
    }

    // ============================================================
    // 周期任务
    // ============================================================

    /// 空闲且有待上传时触发完整同步；返回是否触发
    pub async fn check_and_sync_if_needed(&self) -> Result<bool> {
        if self.ctx.any_running() {
            return Ok(false);
        }
        let pending = self.uploads.pending_count().await?;
        if pending == 0 {
            return Ok(false);
        }
        debug!("周期检查: 待上传 {} 条，触发完整同步", pending);
        self.perform_full_sync().await;
        Ok(true)
    }

    pub fn spawn_periodic_tasks(&self) {
        let weak = self.weak.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.ctx.config.timing_config.auto_sync_check_interval_secs.max(1));
        self.spawn_task(async move {
            let mut interval = tokio::time::interval(period);
            // 第一次 tick 立即返回
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(this) = weak.upgrade() else { break };
                if let Err(e) = this.check_and_sync_if_needed().await {
                    warn!("周期同步检查失败: {}", e);
                }
                if !this.ctx.any_running() {
                    if let Err(e) = this.compaction.compact_if_due().await {
                        warn!("周期压缩失败: {}", e);
                    }
                }
            }
            debug!("周期任务已退出");
        });
    }

    /// 启动后在后台跑一次：首次设置或完整同步
    pub fn spawn_launch_sync(&self) {
        let weak = self.weak.clone();
        self.spawn_task(async move {
            let Some(this) = weak.upgrade() else { return };
            match this.ctx.is_setup_complete().await {
                Ok(true) => {
                    this.perform_full_sync().await;
                }
                Ok(false) => {
                    this.perform_first_time_setup().await;
                }
                Err(e) => warn!("读取首次设置标志失败: {}", e),
            }
        });
    }
}
