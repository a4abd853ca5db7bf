//! 下载管线（DownloadPipeline）
//!
//! 1. 按数据库级 token 拉取有变化 / 被删除的 zone（分页循环）
//! 2. 本 zone 被删除：重置全部 token，清空待上传队列，标记首次设置未完成
//! 3. 每个有变化的 zone 用自己的 token 分页拉取；每页记录按 version 升序应用，
//!    应用完成后才保存该页的 token（中途崩溃从最近一页继续）
//! 4. 被删除的记录单独处理：移除同 cloud_id 的待上传条目与本地实体
//!
//! 数据库级 token 在所有 zone 拉取完成后才保存，避免漏掉 zone。

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::{ControlFlag, SyncContext};
use super::deferred::DeferredDependencyQueue;
use super::entity_sync::{handler_for, ApplyOutcome, RecordApplier, SyncableKind, TokenScope};
use super::record::RemoteRecord;
use super::remote::{RemoteError, ZoneChanges};
use super::{SyncPhase, SyncStatus};
use crate::error::{CloudSyncError, Result};
use crate::events::{event_builders, DataOperation};

/// 一次下载的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// 已有同步在进行，本次跳过
    pub already_running: bool,
    pub zones_fetched: usize,
    pub fetched: usize,
    pub applied: usize,
    pub removed: usize,
    pub kept_local: usize,
    pub skipped_echo: usize,
    pub deferred: usize,
    pub dropped: usize,
    /// 本 zone 在远端被删除，需要重新走首次设置
    pub zone_reset: bool,
}

impl DownloadReport {
    /// 写入本地的变更数
    pub fn changed(&self) -> usize {
        self.applied + self.removed
    }
}

pub struct DownloadPipeline {
    ctx: Arc<SyncContext>,
    deferred: Arc<DeferredDependencyQueue>,
}

impl DownloadPipeline {
    pub fn new(ctx: Arc<SyncContext>, deferred: Arc<DeferredDependencyQueue>) -> Self {
        Self { ctx, deferred }
    }

    pub async fn download_changes(&self) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();

        let start_token = self.ctx.tokens.get(TokenScope::Database).await?;
        let incremental = start_token.is_some();
        let mut token = start_token;
        let mut changed_zones = BTreeSet::new();

        // ========== 数据库级变更 ==========
        loop {
            let changes = self
                .ctx
                .with_timeout(self.ctx.remote.fetch_database_changes(token.as_ref()))
                .await?;

            // 首次拉取时的历史删除与本地无关
            if incremental && changes.deleted_zones.iter().any(|z| z == &self.ctx.zone) {
                self.handle_zone_deleted().await?;
                report.zone_reset = true;
                return Ok(report);
            }
            changed_zones.extend(changes.changed_zones);
            if changes.new_token.is_some() {
                token = changes.new_token;
            }
            if !changes.has_more {
                break;
            }
        }

        if changed_zones.is_empty() {
            debug!("没有 zone 发生变化");
        }

        // ========== zone 级变更 ==========
        for zone in &changed_zones {
            match self.fetch_zone(zone, &mut report).await {
                Ok(()) => report.zones_fetched += 1,
                Err(CloudSyncError::Remote(RemoteError::ZoneNotFound(_))) if zone == &self.ctx.zone => {
                    warn!("⚠️ 拉取时 zone 已不存在: {}", zone);
                    self.handle_zone_deleted().await?;
                    report.zone_reset = true;
                    return Ok(report);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(token) = &token {
            self.ctx.tokens.set(TokenScope::Database, token).await?;
        }

        let changed = report.changed();
        if changed > 0 {
            self.ctx.record_applied(changed);
            self.ctx.emit(event_builders::data_processed(changed)).await;
        }
        info!(
            "✅ 下载完成: 拉取 {} / 应用 {} / 删除 {} / 延迟 {} / 丢弃 {}",
            report.fetched, report.applied, report.removed, report.deferred, report.dropped
        );
        Ok(report)
    }

    async fn fetch_zone(&self, zone: &str, report: &mut DownloadReport) -> Result<()> {
        let mut token = self.ctx.tokens.get(TokenScope::Zone(zone)).await?;
        loop {
            let page = self
                .ctx
                .with_timeout(self.ctx.remote.fetch_zone_changes(zone, token.as_ref()))
                .await?;
            let has_more = page.has_more;
            let new_token = page.new_token.clone();

            report.fetched += page.records.len() + page.deleted_record_ids.len();
            self.report_progress(report.fetched).await;
            self.apply_page(page, report).await?;

            if let Some(new_token) = new_token {
                self.ctx.tokens.set(TokenScope::Zone(zone), &new_token).await?;
                token = Some(new_token);
            }
            if !has_more {
                return Ok(());
            }
        }
    }

    async fn report_progress(&self, fetched: usize) {
        if self.ctx.is_running(ControlFlag::FullSync) {
            self.ctx
                .set_status(SyncStatus::Syncing(SyncPhase::Downloading { fetched }))
                .await;
        }
    }

    /// 应用一页：记录按 version 升序，随后处理删除
    async fn apply_page(&self, page: ZoneChanges, report: &mut DownloadReport) -> Result<()> {
        let mut records = page.records;
        records.sort_by(|a, b| a.record.version.cmp(&b.record.version));

        let applier = RecordApplier::new(self.ctx.local.as_ref(), &self.ctx.device_id, self.ctx.as_ref());
        let mut to_defer = Vec::new();

        for record in records {
            match applier.apply(&record).await {
                Ok(outcome) => self.tally(&record, outcome, report).await,
                Err(e) if e.is_dependency_missing() => {
                    debug!("缺少父实体，延迟: {} {} ({})", record.record.record_type, record.record.cloud_id, e);
                    to_defer.push(record);
                }
                Err(e) => {
                    warn!(
                        "❌ 丢弃入站记录 {} {}: {}",
                        record.record.record_type, record.record.cloud_id, e
                    );
                    report.dropped += 1;
                }
            }
        }

        if !to_defer.is_empty() {
            report.deferred += self.deferred.store_deferred(&to_defer).await?;
        }

        for record_id in &page.deleted_record_ids {
            if self.process_deletion(record_id).await? {
                report.removed += 1;
            }
        }
        Ok(())
    }

    async fn tally(&self, record: &RemoteRecord, outcome: ApplyOutcome, report: &mut DownloadReport) {
        let cloud_id = &record.record.cloud_id;
        match outcome {
            ApplyOutcome::Applied(kind) => {
                report.applied += 1;
                self.ctx
                    .emit(event_builders::data_changed(kind, DataOperation::Upserted, cloud_id))
                    .await;
            }
            ApplyOutcome::Removed(kind) => {
                report.removed += 1;
                self.ctx
                    .emit(event_builders::data_changed(kind, DataOperation::Removed, cloud_id))
                    .await;
            }
            ApplyOutcome::KeptLocal(_) => report.kept_local += 1,
            ApplyOutcome::AlreadyAbsent(_) => {}
            ApplyOutcome::SkippedEcho | ApplyOutcome::SkippedRecentUpload => report.skipped_echo += 1,
        }
    }

    /// 远端删除了记录：清掉对应的待上传条目和本地实体（任意类型）
    pub async fn process_deletion(&self, record_id: &str) -> Result<bool> {
        for upload in self.ctx.pending.find_by_cloud_id(record_id).await? {
            debug!("远端已删除，移除待上传条目: {} {}", upload.kind, record_id);
            self.ctx.pending.dequeue(upload.luid).await?;
        }

        let mut removed = false;
        for kind in SyncableKind::UPLOAD_ORDER {
            if handler_for(kind).apply_delete(self.ctx.local.as_ref(), record_id).await? {
                debug!("远端删除已应用: {} {}", kind, record_id);
                self.ctx
                    .emit(event_builders::data_changed(kind, DataOperation::Removed, record_id))
                    .await;
                removed = true;
            }
        }
        Ok(removed)
    }

    /// 本 zone 被删除：回到首次设置语义
    async fn handle_zone_deleted(&self) -> Result<()> {
        warn!("⚠️ 远端 zone 已被删除: {}，重置同步状态", self.ctx.zone);
        let tokens = self.ctx.tokens.reset_all().await?;
        let pending = self.ctx.pending.clear().await?;
        let deferred = self.deferred.clear().await?;
        self.ctx.set_setup_complete(false).await?;
        info!(
            "已清除 token {} 个、待上传 {} 条、延迟记录 {} 条",
            tokens, pending, deferred
        );
        self.ctx.emit(event_builders::zone_reset(&self.ctx.zone)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{Conversation, Message, MessageRole};
    use crate::storage::local_store::LocalStore;
    use crate::sync::context::test_support::TestHarness;
    use crate::sync::entity_sync::payload::{ConversationPayload, MessagePayload, SyncPayload};
    use crate::sync::record::SyncRecord;
    use crate::sync::remote::memory::RemoteOp;
    use crate::sync::remote::RemoteStore;
    use chrono::{DateTime, Utc};

    fn conversation_record(cloud_id: &str, title: &str, version: DateTime<Utc>, origin: &str) -> RemoteRecord {
        let mut conv = Conversation::new(title, version);
        conv.cloud_id = cloud_id.to_string();
        let payload = SyncPayload::Conversation(ConversationPayload::from_entity(&conv))
            .encode_checked(cloud_id)
            .unwrap();
        RemoteRecord::new(SyncRecord::live(cloud_id, SyncableKind::Conversation, version, origin, payload))
    }

    fn message_record(cloud_id: &str, parent: &str, version: DateTime<Utc>) -> RemoteRecord {
        let mut message = Message::new(0, MessageRole::Assistant, "reply", version);
        message.cloud_id = cloud_id.to_string();
        let payload = SyncPayload::Message(MessagePayload::from_entity(&message, parent))
            .encode_checked(cloud_id)
            .unwrap();
        RemoteRecord::new(SyncRecord::live(cloud_id, SyncableKind::Message, version, "BBB", payload))
    }

    fn pipeline(h: &TestHarness) -> DownloadPipeline {
        DownloadPipeline::new(h.ctx.clone(), Arc::new(DeferredDependencyQueue::new(h.ctx.clone())))
    }

    #[tokio::test]
    async fn test_records_are_applied_in_version_order() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        let now = h.ctx.now();

        // 子消息版本更晚但先写入远端
        h.remote.insert_raw(&zone, message_record("m1", "c1", now + chrono::Duration::seconds(1)));
        h.remote.insert_raw(&zone, conversation_record("c1", "hello", now, "BBB"));

        let report = pipeline(&h).download_changes().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.deferred, 0);
        assert!(h.local.find_by_cloud_id(SyncableKind::Message, "m1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_parent_is_deferred() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        h.remote.insert_raw(&zone, message_record("m1", "c-missing", h.ctx.now()));

        let report = pipeline(&h).download_changes().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dropped, 0);
        assert_eq!(h.ctx.deferred_store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_records_are_dropped() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        let mut unknown = conversation_record("x1", "t", h.ctx.now(), "BBB");
        unknown.record.record_type = "folder".to_string();
        let mut no_payload = conversation_record("x2", "t", h.ctx.now(), "BBB");
        no_payload.record.payload = None;
        h.remote.insert_raw(&zone, unknown);
        h.remote.insert_raw(&zone, no_payload);

        let report = pipeline(&h).download_changes().await.unwrap();
        assert_eq!(report.dropped, 2);
        assert_eq!(h.ctx.deferred_store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tokens_make_fetch_incremental() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        h.remote.insert_raw(&zone, conversation_record("c1", "one", h.ctx.now(), "BBB"));

        let downloads = pipeline(&h);
        assert_eq!(downloads.download_changes().await.unwrap().fetched, 1);
        assert_eq!(downloads.download_changes().await.unwrap().fetched, 0);

        h.remote.insert_raw(&zone, conversation_record("c2", "two", h.ctx.now(), "BBB"));
        let report = downloads.download_changes().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn test_token_saved_after_each_page() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        h.remote.set_page_size(2);
        for i in 0..5 {
            h.remote
                .insert_raw(&zone, conversation_record(&format!("c{}", i), "t", h.ctx.now(), "BBB"));
        }

        // 第一页成功，第二页失败
        h.remote.fail_after(RemoteOp::FetchZoneChanges, 1, RemoteError::NetworkFailure);
        let downloads = pipeline(&h);
        assert!(downloads.download_changes().await.is_err());
        assert_eq!(h.local.count(SyncableKind::Conversation).await.unwrap(), 2);
        assert!(h.ctx.tokens.get(TokenScope::Zone(&zone)).await.unwrap().is_some());
        // 数据库级 token 尚未推进
        assert!(h.ctx.tokens.get(TokenScope::Database).await.unwrap().is_none());

        // 从已保存的 zone token 继续，只拉剩下的 3 条
        let report = downloads.download_changes().await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(h.local.count(SyncableKind::Conversation).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_remote_deletions_clear_pending_and_local() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        h.remote.insert_raw(&zone, conversation_record("c1", "one", h.ctx.now(), "BBB"));
        let downloads = pipeline(&h);
        downloads.download_changes().await.unwrap();

        // 本地又改了一次，已入队
        let luid = h.ctx.pending.next_luid().unwrap();
        h.ctx
            .pending
            .put(&crate::storage::queue::PendingUpload {
                luid,
                cloud_id: "c1".to_string(),
                kind: SyncableKind::Conversation,
                version: h.ctx.now(),
                payload: None,
                removed: false,
            })
            .await
            .unwrap();

        h.remote.delete_records(&zone, &["c1".to_string()]).await.unwrap();
        let report = downloads.download_changes().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(h.ctx.pending.count().await.unwrap(), 0);
        assert!(h.local.find_by_cloud_id(SyncableKind::Conversation, "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zone_deletion_resets_state() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        h.remote.insert_raw(&zone, conversation_record("c1", "one", h.ctx.now(), "BBB"));
        let downloads = pipeline(&h);
        downloads.download_changes().await.unwrap();
        h.ctx.set_setup_complete(true).await.unwrap();

        let luid = h.ctx.pending.next_luid().unwrap();
        h.ctx
            .pending
            .put(&crate::storage::queue::PendingUpload {
                luid,
                cloud_id: "c9".to_string(),
                kind: SyncableKind::Conversation,
                version: h.ctx.now(),
                payload: None,
                removed: false,
            })
            .await
            .unwrap();

        h.remote.delete_zone(&zone);
        let report = downloads.download_changes().await.unwrap();
        assert!(report.zone_reset);
        assert!(!h.ctx.is_setup_complete().await.unwrap());
        assert_eq!(h.ctx.pending.count().await.unwrap(), 0);
        assert!(h.ctx.tokens.get(TokenScope::Database).await.unwrap().is_none());
        assert!(h.ctx.tokens.get(TokenScope::Zone(&zone)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_applying_twice_is_idempotent() {
        let h = TestHarness::new("AAA").await;
        let zone = h.ctx.zone.clone();
        h.remote.create_zone_sync(&zone);
        let record = conversation_record("c1", "same", h.ctx.now(), "BBB");
        h.remote.insert_raw(&zone, record.clone());

        let downloads = pipeline(&h);
        downloads.download_changes().await.unwrap();
        let first = h.local.list(SyncableKind::Conversation).await.unwrap();

        // 重复投递同一条记录
        h.remote.insert_raw(&zone, record);
        downloads.download_changes().await.unwrap();
        let second = h.local.list(SyncableKind::Conversation).await.unwrap();
        assert_eq!(first, second);
    }
}
