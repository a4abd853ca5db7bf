//! 上传队列（UploadQueue）
//!
//! - `enqueue`：本地变更入队，创建时分配 cloud_id（之后不再改变），
//!   按 `(cloud_id, type)` 去重
//! - `upload_pending`：按固定类型顺序（model → conversation → message → attachment）
//!   分批（≤400）推送，父实体总是与子实体同批或更早
//!
//! 远端逐条错误的处置：
//! - 版本冲突：不强制覆盖，条目保留，由协调器触发一次下载对齐
//! - 可重试：条目保留等下一轮
//! - 不可重试：丢弃条目并记录日志，避免无限重试

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::context::{ControlFlag, SyncContext};
use super::entity_sync::handlers::parent_local_id;
use super::entity_sync::{handler_for, SyncableKind};
use super::record::SyncRecord;
use super::remote::{RemoteError, UploadDisposition};
use super::{SyncPhase, SyncStatus};
use crate::error::{CloudSyncError, Result};
use crate::events::event_builders;
use crate::storage::entities::{LocalChangeType, SyncEntity};
use crate::storage::queue::PendingUpload;

/// 一次上传的统计
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    /// 另一次上传正在进行，本次直接返回
    pub already_running: bool,
    pub total_pending: usize,
    pub uploaded: usize,
    pub dropped: usize,
    /// 父实体尚无 cloud_id，留待下一轮
    pub waiting_on_parent: usize,
    pub skipped: usize,
    /// 远端版本已变化的条目数
    pub conflicts: usize,
    /// 逐条返回的可重试错误（取最后一个）
    pub retryable_error: Option<RemoteError>,
    /// 整批请求失败
    pub batch_error: Option<RemoteError>,
}

impl UploadReport {
    pub fn needs_reconcile(&self) -> bool {
        self.conflicts > 0
    }

    /// 需要交给 RetryScheduler 的错误
    pub fn retry_error(&self) -> Option<&RemoteError> {
        self.batch_error
            .as_ref()
            .filter(|e| e.is_retryable())
            .or(self.retryable_error.as_ref())
    }
}

pub struct UploadQueue {
    ctx: Arc<SyncContext>,
}

impl UploadQueue {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    // ============================================================
    // 入队
    // ============================================================

    /// 记录一次本地变更，返回带 cloud_id 的实体
    pub async fn enqueue(&self, entity: &SyncEntity, change: LocalChangeType) -> Result<SyncEntity> {
        let mut entity = entity.clone();
        let removed = change.is_delete();

        if entity.cloud_id().is_empty() {
            if removed {
                debug!("{} 从未同步过，删除无需上传", entity.kind());
                return Ok(entity);
            }
            entity.set_cloud_id(uuid::Uuid::new_v4().to_string());
            entity = self.ctx.local.upsert(entity).await?;
            debug!("分配 cloud_id: {} {}", entity.kind(), entity.cloud_id());
        }

        let kind = entity.kind();
        let cloud_id = entity.cloud_id().to_string();
        let now = self.ctx.now();

        match self.ctx.pending.find(kind, &cloud_id).await? {
            Some(existing) if existing.removed == removed => {
                // 同类变更不重复入队；上传进行中时刷新版本，避免在途确认把新变更出队
                if self.ctx.is_running(ControlFlag::Upload) {
                    let refreshed = PendingUpload {
                        version: now,
                        payload: None,
                        ..existing
                    };
                    self.ctx.pending.put(&refreshed).await?;
                }
                debug!("{} {} 已在队列中", kind, cloud_id);
            }
            Some(existing) => {
                let replaced = PendingUpload {
                    version: now,
                    payload: None,
                    removed,
                    ..existing
                };
                self.ctx.pending.put(&replaced).await?;
                debug!("替换队列条目: {} {} (removed={})", kind, cloud_id, removed);
            }
            None => {
                let upload = PendingUpload {
                    luid: self.ctx.pending.next_luid()?,
                    cloud_id: cloud_id.clone(),
                    kind,
                    version: now,
                    payload: None,
                    removed,
                };
                self.ctx.pending.put(&upload).await?;
                debug!("入队: {} {} (luid={}, removed={})", kind, cloud_id, upload.luid, removed);
            }
        }

        Ok(entity)
    }

    /// 把窗口内修改过的会话和消息重新入队
    pub async fn enqueue_modified_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let mut count = 0usize;
        for kind in [SyncableKind::Conversation, SyncableKind::Message] {
            for entity in self.ctx.local.modified_since(kind, since).await? {
                self.enqueue(&entity, LocalChangeType::Update).await?;
                count += 1;
            }
        }
        info!("🔄 已重新入队最近修改的实体: {} 个", count);
        Ok(count)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.ctx.pending.count().await
    }

    // ============================================================
    // 推送
    // ============================================================

    pub async fn upload_pending(&self) -> Result<UploadReport> {
        let Some(_guard) = self.ctx.try_begin(ControlFlag::Upload) else {
            debug!("上传已在进行中，跳过");
            return Ok(UploadReport {
                already_running: true,
                ..Default::default()
            });
        };

        self.purge_without_cloud_id().await?;

        let all = self.ctx.pending.list().await?;
        let mut report = UploadReport {
            total_pending: all.len(),
            ..Default::default()
        };
        if all.is_empty() {
            return Ok(report);
        }
        info!("开始上传: {} 条待上传变更", all.len());

        let batch_size = self.ctx.config.queue_config.upload_batch_size.max(1);
        let mut processed = 0usize;
        'kinds: for kind in SyncableKind::UPLOAD_ORDER {
            let items: Vec<PendingUpload> = all.iter().filter(|u| u.kind == kind).cloned().collect();
            for chunk in items.chunks(batch_size) {
                let keep_going = self.upload_batch(chunk, &mut report).await?;
                processed += chunk.len();
                self.report_progress(processed, all.len()).await;
                if !keep_going {
                    break 'kinds;
                }
            }
        }

        info!(
            "✅ 上传结束: 成功 {} / 丢弃 {} / 等待父实体 {} / 冲突 {}",
            report.uploaded, report.dropped, report.waiting_on_parent, report.conflicts
        );
        Ok(report)
    }

    async fn report_progress(&self, current: usize, total: usize) {
        if self.ctx.is_running(ControlFlag::FullSync) {
            self.ctx
                .set_status(SyncStatus::Syncing(SyncPhase::Uploading { current, total }))
                .await;
        }
    }

    async fn purge_without_cloud_id(&self) -> Result<()> {
        for upload in self.ctx.pending.list().await? {
            if upload.cloud_id.is_empty() {
                warn!("清理缺少 cloud_id 的待上传条目: {} luid={}", upload.kind, upload.luid);
                self.ctx.pending.dequeue(upload.luid).await?;
            }
        }
        Ok(())
    }

    /// 上传一批；返回 false 表示整批请求失败，本轮停止
    async fn upload_batch(&self, chunk: &[PendingUpload], report: &mut UploadReport) -> Result<bool> {
        let mut items = chunk.to_vec();
        items.sort_by_key(|u| u.luid);

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(items.len());
        let mut sent = Vec::with_capacity(items.len());
        for item in items {
            if !seen.insert(item.cloud_id.clone()) {
                debug!("批内重复的 cloud_id，跳过: {}", item.cloud_id);
                continue;
            }
            match self.build_record(&item).await {
                Ok(record) => {
                    records.push(record);
                    sent.push(item);
                }
                Err(e) if e.is_dependency_missing() => {
                    debug!("{} {} 等待父实体: {}", item.kind, item.cloud_id, e);
                    report.waiting_on_parent += 1;
                    if let Err(e) = self.resolve_parent(&item).await {
                        warn!("为 {} {} 准备父实体失败: {}", item.kind, item.cloud_id, e);
                    }
                }
                Err(e @ (CloudSyncError::PayloadTooLarge { .. } | CloudSyncError::NotFound(_))) => {
                    self.drop_item(&item, &e.to_string(), report).await?;
                }
                Err(e) => {
                    warn!("编码 {} {} 失败，本轮跳过: {}", item.kind, item.cloud_id, e);
                    report.skipped += 1;
                }
            }
        }

        if records.is_empty() {
            return Ok(true);
        }

        let result = self
            .ctx
            .with_timeout(self.ctx.remote.save_records(&self.ctx.zone, records))
            .await;
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!("⚠️ 批量保存失败 ({} 条): {}", sent.len(), e);
                report.batch_error = Some(e);
                return Ok(false);
            }
        };

        let saved: HashSet<&str> = result.saved.iter().map(String::as_str).collect();
        for item in sent.iter().filter(|u| saved.contains(u.cloud_id.as_str())) {
            if !self.ctx.pending.dequeue_if_unchanged(item).await? {
                debug!("{} {} 在上传期间有新变更，保留在队列中", item.kind, item.cloud_id);
            }
            report.uploaded += 1;
        }
        self.ctx.mark_uploaded(result.saved.iter().map(String::as_str));

        for item in &sent {
            let Some(err) = result.errors.get(&item.cloud_id) else {
                continue;
            };
            match err.upload_disposition() {
                UploadDisposition::Reconcile => {
                    info!("远端版本已变化，等待下载对齐: {} {}", item.kind, item.cloud_id);
                    report.conflicts += 1;
                }
                UploadDisposition::Keep => {
                    warn!("{} {} 暂时失败，保留: {}", item.kind, item.cloud_id, err);
                    if err.is_retryable() {
                        report.retryable_error = Some(err.clone());
                    }
                }
                UploadDisposition::Drop => {
                    self.drop_item(item, &err.to_string(), report).await?;
                }
            }
        }
        Ok(true)
    }

    async fn drop_item(&self, item: &PendingUpload, reason: &str, report: &mut UploadReport) -> Result<()> {
        warn!("❌ 丢弃上传 {} {}: {}", item.kind, item.cloud_id, reason);
        self.ctx.pending.dequeue(item.luid).await?;
        report.dropped += 1;
        self.ctx
            .emit(event_builders::upload_dropped(item.kind, &item.cloud_id, reason))
            .await;
        Ok(())
    }

    /// 生成上行记录；payload 在此时从本地实体编码
    async fn build_record(&self, item: &PendingUpload) -> Result<SyncRecord> {
        if item.removed {
            return Ok(SyncRecord::tombstone(
                item.cloud_id.clone(),
                item.kind,
                item.version,
                self.ctx.device_id.clone(),
            ));
        }

        let payload = match &item.payload {
            Some(bytes) => bytes.clone(),
            None => {
                let entity = self
                    .ctx
                    .local
                    .find_by_cloud_id(item.kind, &item.cloud_id)
                    .await?
                    .ok_or_else(|| CloudSyncError::NotFound(format!("本地实体已不存在: {} {}", item.kind, item.cloud_id)))?;
                handler_for(item.kind)
                    .encode(self.ctx.local.as_ref(), &entity)
                    .await?
                    .encode_checked(&item.cloud_id)?
            }
        };

        Ok(SyncRecord::live(
            item.cloud_id.clone(),
            item.kind,
            item.version,
            self.ctx.device_id.clone(),
            payload,
        ))
    }

    /// 父实体还没有 cloud_id：分配并入队创建，子实体下一轮再传
    async fn resolve_parent(&self, item: &PendingUpload) -> Result<()> {
        let Some(entity) = self.ctx.local.find_by_cloud_id(item.kind, &item.cloud_id).await? else {
            return Ok(());
        };
        let Some((parent_kind, parent_id)) = parent_local_id(&entity) else {
            return Ok(());
        };
        if let Some(parent) = self.ctx.local.find_by_local_id(parent_kind, parent_id).await? {
            if parent.cloud_id().is_empty() {
                let parent = self.enqueue(&parent, LocalChangeType::Create).await?;
                info!("为父实体分配 cloud_id 并入队: {} {}", parent_kind, parent.cloud_id());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{Attachment, Conversation, Message, MessageRole, ModelConfig};
    use crate::storage::local_store::LocalStore;
    use crate::sync::context::test_support::TestHarness;
    use crate::sync::remote::memory::RemoteOp;

    async fn conversation(h: &TestHarness, title: &str) -> SyncEntity {
        h.local.upsert(Conversation::new(title, h.ctx.now()).into()).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_cloud_id_once() {
        let h = TestHarness::new("AAA").await;
        let queue = UploadQueue::new(h.ctx.clone());

        let conv = conversation(&h, "c").await;
        let queued = queue.enqueue(&conv, LocalChangeType::Create).await.unwrap();
        assert!(!queued.cloud_id().is_empty());

        // 本地也已写回 cloud_id
        let stored = h.local.find_by_local_id(SyncableKind::Conversation, conv.local_id().unwrap()).await.unwrap();
        assert_eq!(stored.unwrap().cloud_id(), queued.cloud_id());

        // 同类变更不重复入队，cloud_id 不变
        let again = queue.enqueue(&queued, LocalChangeType::Update).await.unwrap();
        assert_eq!(again.cloud_id(), queued.cloud_id());
        assert_eq!(h.ctx.pending.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_replaces_pending_entry() {
        let h = TestHarness::new("AAA").await;
        let queue = UploadQueue::new(h.ctx.clone());

        let conv = queue.enqueue(&conversation(&h, "c").await, LocalChangeType::Create).await.unwrap();
        let before = h.ctx.pending.list().await.unwrap().remove(0);

        h.clock.advance(chrono::Duration::seconds(5));
        queue.enqueue(&conv, LocalChangeType::Delete).await.unwrap();

        let after = h.ctx.pending.list().await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].luid, before.luid);
        assert!(after[0].removed);
        assert!(after[0].version > before.version);
    }

    #[tokio::test]
    async fn test_delete_of_never_synced_entity_is_not_queued() {
        let h = TestHarness::new("AAA").await;
        let queue = UploadQueue::new(h.ctx.clone());
        queue.enqueue(&conversation(&h, "c").await, LocalChangeType::Delete).await.unwrap();
        assert_eq!(h.ctx.pending.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upload_follows_type_order() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let queue = UploadQueue::new(h.ctx.clone());
        let now = h.ctx.now();

        // 子实体先入队
        let conv = queue.enqueue(&conversation(&h, "c").await, LocalChangeType::Create).await.unwrap();
        let msg = h
            .local
            .upsert(Message::new(conv.local_id().unwrap(), MessageRole::User, "hi", now).into())
            .await
            .unwrap();
        let msg = queue.enqueue(&msg, LocalChangeType::Create).await.unwrap();
        let att = h
            .local
            .upsert(Attachment::new(msg.local_id().unwrap(), "a.png", now).into())
            .await
            .unwrap();
        queue.enqueue(&att, LocalChangeType::Create).await.unwrap();
        let model: SyncEntity = ModelConfig::new("m", "https://example.invalid", now).into();
        queue.enqueue(&model, LocalChangeType::Create).await.unwrap();

        let report = queue.upload_pending().await.unwrap();
        assert_eq!(report.uploaded, 4);
        assert_eq!(h.ctx.pending.count().await.unwrap(), 0);

        let kinds: Vec<String> = h
            .remote
            .save_batches()
            .into_iter()
            .flat_map(|batch| batch.into_iter().map(|r| r.record_type))
            .collect();
        assert_eq!(kinds, vec!["model", "conversation", "message", "attachment"]);
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let mut config = h.ctx.config.clone();
        config.queue_config.upload_batch_size = 2;
        let h = TestHarness::with_config(config, h.remote.clone(), tempfile::TempDir::new().unwrap()).await;
        let queue = UploadQueue::new(h.ctx.clone());

        for i in 0..5 {
            queue
                .enqueue(&conversation(&h, &format!("c{}", i)).await, LocalChangeType::Create)
                .await
                .unwrap();
        }
        queue.upload_pending().await.unwrap();
        let sizes: Vec<usize> = h.remote.save_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_per_record_error_dispositions() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let queue = UploadQueue::new(h.ctx.clone());

        let fatal = queue.enqueue(&conversation(&h, "fatal").await, LocalChangeType::Create).await.unwrap();
        let busy = queue.enqueue(&conversation(&h, "busy").await, LocalChangeType::Create).await.unwrap();
        let stale = queue.enqueue(&conversation(&h, "stale").await, LocalChangeType::Create).await.unwrap();
        h.remote.set_record_error(fatal.cloud_id(), RemoteError::PermissionFailure);
        h.remote.set_record_error(busy.cloud_id(), RemoteError::ZoneBusy);
        h.remote.set_record_error(stale.cloud_id(), RemoteError::ServerRecordChanged);

        let mut events = h.ctx.events.subscribe();
        let report = queue.upload_pending().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.conflicts, 1);
        assert!(report.needs_reconcile());
        assert_eq!(report.retry_error(), Some(&RemoteError::ZoneBusy));

        let remaining: HashSet<String> = h.ctx.pending.list().await.unwrap().into_iter().map(|u| u.cloud_id).collect();
        assert!(!remaining.contains(fatal.cloud_id()));
        assert!(remaining.contains(busy.cloud_id()));
        assert!(remaining.contains(stale.cloud_id()));

        let mut dropped = false;
        while let Ok(event) = events.try_recv() {
            if let crate::events::SyncEvent::UploadDropped { cloud_id, .. } = event {
                dropped |= cloud_id == fatal.cloud_id();
            }
        }
        assert!(dropped);
    }

    #[tokio::test]
    async fn test_batch_failure_keeps_items() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let queue = UploadQueue::new(h.ctx.clone());
        queue.enqueue(&conversation(&h, "c").await, LocalChangeType::Create).await.unwrap();

        h.remote.fail_next(RemoteOp::SaveRecords, RemoteError::NetworkFailure);
        let report = queue.upload_pending().await.unwrap();
        assert_eq!(report.batch_error, Some(RemoteError::NetworkFailure));
        assert_eq!(report.retry_error(), Some(&RemoteError::NetworkFailure));
        assert_eq!(h.ctx.pending.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oversize_payload_is_dropped() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let queue = UploadQueue::new(h.ctx.clone());

        let conv = queue.enqueue(&conversation(&h, "c").await, LocalChangeType::Create).await.unwrap();
        let msg = h
            .local
            .upsert(Message::new(conv.local_id().unwrap(), MessageRole::User, "中".repeat(500_000), h.ctx.now()).into())
            .await
            .unwrap();
        queue.enqueue(&msg, LocalChangeType::Create).await.unwrap();

        let report = queue.upload_pending().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(h.ctx.pending.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parent_without_cloud_id_is_enqueued() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let queue = UploadQueue::new(h.ctx.clone());

        // 父会话从未入队，没有 cloud_id
        let conv = conversation(&h, "c").await;
        let msg = h
            .local
            .upsert(Message::new(conv.local_id().unwrap(), MessageRole::User, "hi", h.ctx.now()).into())
            .await
            .unwrap();
        queue.enqueue(&msg, LocalChangeType::Create).await.unwrap();

        let first = queue.upload_pending().await.unwrap();
        assert_eq!(first.waiting_on_parent, 1);
        assert_eq!(first.uploaded, 0);
        assert_eq!(h.ctx.pending.count().await.unwrap(), 2);

        let second = queue.upload_pending().await.unwrap();
        assert_eq!(second.uploaded, 2);
        assert_eq!(h.remote.records(&h.ctx.zone).len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_local_entity_is_dropped() {
        let h = TestHarness::new("AAA").await;
        h.remote.create_zone_sync(&h.ctx.zone);
        let queue = UploadQueue::new(h.ctx.clone());

        let conv = queue.enqueue(&conversation(&h, "c").await, LocalChangeType::Create).await.unwrap();
        h.local.remove(SyncableKind::Conversation, conv.cloud_id()).await.unwrap();

        let report = queue.upload_pending().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(h.ctx.pending.count().await.unwrap(), 0);
    }
}
