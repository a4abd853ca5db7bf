//! 远端历史压缩（CompactionEngine）
//!
//! 拉取早于保留窗口（30 天）的远端记录，按 cloud_id 分组。
//! 组内多于一个版本时：
//! - 最新版本是 tombstone：整组删除
//! - 否则保留最新版本，删除其余
//!
//! 删除按固定批大小（≤400）提交。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::context::SyncContext;
use super::record::RemoteRecord;
use super::remote::RecordQuery;
use crate::error::Result;
use crate::events::event_builders;

const LAST_RUN_KEY: &str = "compaction:last_run";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub scanned: usize,
    /// 含多个版本的分组数
    pub groups: usize,
    pub deleted: usize,
}

pub struct CompactionEngine {
    ctx: Arc<SyncContext>,
}

impl CompactionEngine {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub async fn last_run(&self) -> Result<Option<DateTime<Utc>>> {
        self.ctx.kv.get(LAST_RUN_KEY).await
    }

    /// 距上次压缩是否已超过间隔
    pub async fn is_due(&self) -> Result<bool> {
        let interval = chrono::Duration::days(self.ctx.config.compaction_config.interval_days);
        Ok(match self.last_run().await? {
            Some(at) => self.ctx.now() - at >= interval,
            None => true,
        })
    }

    pub async fn compact_if_due(&self) -> Result<Option<CompactionReport>> {
        if !self.is_due().await? {
            debug!("距上次压缩不足间隔，跳过");
            return Ok(None);
        }
        self.compact().await.map(Some)
    }

    pub async fn compact(&self) -> Result<CompactionReport> {
        let config = &self.ctx.config.compaction_config;
        let cutoff = self.ctx.now() - chrono::Duration::days(config.retention_days);
        info!("🔄 开始压缩远端历史（早于 {}）", cutoff);

        let records = self.fetch_older_than(cutoff).await?;
        let mut report = CompactionReport {
            scanned: records.len(),
            ..Default::default()
        };

        let mut groups: HashMap<String, Vec<RemoteRecord>> = HashMap::new();
        for record in records {
            groups.entry(record.record.cloud_id.clone()).or_default().push(record);
        }

        let mut doomed = Vec::new();
        for (cloud_id, mut versions) in groups {
            if versions.len() < 2 {
                continue;
            }
            report.groups += 1;
            versions.sort_by(|a, b| {
                a.record
                    .version
                    .cmp(&b.record.version)
                    .then_with(|| a.record_id.cmp(&b.record_id))
            });
            let newest_removed = versions.last().map(|r| r.record.removed).unwrap_or(false);
            let keep = if newest_removed { 0 } else { 1 };
            debug!(
                "{} 共 {} 个版本，最新为{}，删除 {} 个",
                cloud_id,
                versions.len(),
                if newest_removed { "删除标记" } else { "有效内容" },
                versions.len() - keep
            );
            let delete_count = versions.len() - keep;
            doomed.extend(versions.into_iter().take(delete_count).map(|r| r.record_id));
        }

        for chunk in doomed.chunks(config.delete_batch_size.max(1)) {
            self.ctx
                .with_timeout(self.ctx.remote.delete_records(&self.ctx.zone, chunk))
                .await?;
            report.deleted += chunk.len();
        }

        self.ctx.kv.set(LAST_RUN_KEY, &self.ctx.now()).await?;
        self.ctx.emit(event_builders::compaction_finished(report.deleted)).await;
        info!(
            "✅ 压缩完成: 扫描 {} 条，{} 组，删除 {} 条",
            report.scanned, report.groups, report.deleted
        );
        Ok(report)
    }

    async fn fetch_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<RemoteRecord>> {
        let mut query = RecordQuery {
            older_than: cutoff,
            limit: self.ctx.config.compaction_config.query_page_size,
            cursor: None,
        };
        let mut records = Vec::new();
        loop {
            let page = self.ctx.with_timeout(self.ctx.remote.query(&self.ctx.zone, &query)).await?;
            records.extend(page.records);
            match page.next_cursor {
                Some(cursor) => query.cursor = Some(cursor),
                None => return Ok(records),
            }
        }
    }
}
