//! 延迟依赖队列（DeferredDependencyQueue）
//!
//! 下载时父实体尚未到达的记录暂存在这里，每轮同步重新尝试：
//! - 成功：移除
//! - 仍然 `DependencyMissing`：重试计数 +1，达到上限（10）后永久丢弃
//! - 其他错误：立即丢弃
//!
//! 另有独立的按时间清理：`last_attempt` 早于 7 天的条目无条件丢弃。

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::context::SyncContext;
use super::entity_sync::{ApplyOutcome, RecordApplier};
use super::record::RemoteRecord;
use crate::error::Result;
use crate::events::{event_builders, DataOperation};
use crate::storage::queue::DeferredRecord;

/// 一次处理的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredReport {
    pub attempted: usize,
    pub applied: usize,
    pub rescheduled: usize,
    pub discarded: usize,
    pub expired: usize,
}

pub struct DeferredDependencyQueue {
    ctx: Arc<SyncContext>,
}

impl DeferredDependencyQueue {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// 暂存无法应用的记录；已存在的条目保留原重试计数
    pub async fn store_deferred(&self, records: &[RemoteRecord]) -> Result<usize> {
        let now = self.ctx.now();
        for record in records {
            let retry_count = self
                .ctx
                .deferred_store
                .get(&record.record_id)
                .await?
                .map(|existing| existing.retry_count)
                .unwrap_or(0);
            self.ctx
                .deferred_store
                .put(&DeferredRecord {
                    record_name: record.record_id.clone(),
                    serialized_record: record.to_bytes()?,
                    retry_count,
                    last_attempt: now,
                })
                .await?;
            debug!(
                "⏸️ 延迟记录: {} {} (retry_count={})",
                record.record.record_type, record.record.cloud_id, retry_count
            );
        }
        Ok(records.len())
    }

    /// 一轮处理：重新尝试所有延迟记录
    pub async fn process_deferred(&self) -> Result<DeferredReport> {
        let mut report = DeferredReport {
            expired: self.sweep_expired().await?,
            ..Default::default()
        };

        let entries = self.ctx.deferred_store.list().await?;
        if entries.is_empty() {
            return Ok(report);
        }
        debug!("处理延迟记录: {} 条", entries.len());

        let applier = RecordApplier::new(self.ctx.local.as_ref(), &self.ctx.device_id, self.ctx.as_ref());
        let max_retries = self.ctx.config.queue_config.deferred_max_retries;

        for entry in entries {
            report.attempted += 1;
            let record = match RemoteRecord::from_bytes(&entry.serialized_record) {
                Ok(record) => record,
                Err(e) => {
                    warn!("延迟记录无法解码，丢弃 {}: {}", entry.record_name, e);
                    self.ctx.deferred_store.remove(&entry.record_name).await?;
                    report.discarded += 1;
                    continue;
                }
            };

            match applier.apply(&record).await {
                Ok(outcome) => {
                    self.ctx.deferred_store.remove(&entry.record_name).await?;
                    report.applied += 1;
                    self.publish(&record, outcome).await;
                }
                Err(e) if e.is_dependency_missing() => {
                    let retry_count = entry.retry_count + 1;
                    if retry_count >= max_retries {
                        warn!(
                            "❌ 延迟记录重试 {} 次仍缺少依赖，丢弃: {} {}",
                            retry_count, record.record.record_type, record.record.cloud_id
                        );
                        self.ctx.deferred_store.remove(&entry.record_name).await?;
                        report.discarded += 1;
                    } else {
                        self.ctx
                            .deferred_store
                            .put(&DeferredRecord {
                                retry_count,
                                last_attempt: self.ctx.now(),
                                ..entry
                            })
                            .await?;
                        report.rescheduled += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        "❌ 延迟记录应用失败，丢弃: {} {}: {}",
                        record.record.record_type, record.record.cloud_id, e
                    );
                    self.ctx.deferred_store.remove(&entry.record_name).await?;
                    report.discarded += 1;
                }
            }
        }

        if report.applied > 0 {
            self.ctx.record_applied(report.applied);
            self.ctx.emit(event_builders::data_processed(report.applied)).await;
            info!("✅ 延迟记录已应用: {} 条", report.applied);
        }
        Ok(report)
    }

    /// 清理超过最长保留时间的条目
    pub async fn sweep_expired(&self) -> Result<usize> {
        let max_age = chrono::Duration::days(self.ctx.config.queue_config.deferred_max_age_days);
        let removed = self.ctx.deferred_store.remove_older_than(self.ctx.now() - max_age).await?;
        if removed > 0 {
            info!("清理过期延迟记录: {} 条", removed);
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<usize> {
        self.ctx.deferred_store.count().await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.ctx.deferred_store.clear().await
    }

    async fn publish(&self, record: &RemoteRecord, outcome: ApplyOutcome) {
        let event = match outcome {
            ApplyOutcome::Applied(kind) => {
                event_builders::data_changed(kind, DataOperation::Upserted, &record.record.cloud_id)
            }
            ApplyOutcome::Removed(kind) => {
                event_builders::data_changed(kind, DataOperation::Removed, &record.record.cloud_id)
            }
            _ => return,
        };
        self.ctx.emit(event).await;
    }
}
