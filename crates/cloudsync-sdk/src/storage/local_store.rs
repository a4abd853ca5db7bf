//! 本地存储抽象
//!
//! 同步引擎只依赖这一组 CRUD 操作；SQLite 实现见 `sqlite.rs`，
//! 内存实现见 `memory.rs`（测试 / 嵌入场景）。实现方需保证线程安全。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::storage::entities::SyncEntity;
use crate::sync::entity_sync::SyncableKind;

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// 按 cloud_id 查找实体
    async fn find_by_cloud_id(&self, kind: SyncableKind, cloud_id: &str) -> Result<Option<SyncEntity>>;

    /// 按本地主键查找实体（模型配置没有数值主键，总是返回 None）
    async fn find_by_local_id(&self, kind: SyncableKind, local_id: i64) -> Result<Option<SyncEntity>>;

    /// 插入或更新实体，返回落库后的实体（新插入时带上分配的本地主键）
    ///
    /// 匹配顺序：本地主键（非 0）→ cloud_id（非空）→ 新插入。
    async fn upsert(&self, entity: SyncEntity) -> Result<SyncEntity>;

    /// 按 cloud_id 删除实体（级联删除子实体），返回是否存在过
    async fn remove(&self, kind: SyncableKind, cloud_id: &str) -> Result<bool>;

    /// 列出某类实体
    async fn list(&self, kind: SyncableKind) -> Result<Vec<SyncEntity>>;

    /// 列出 last_modified 不早于 `since` 的实体
    async fn modified_since(&self, kind: SyncableKind, since: DateTime<Utc>) -> Result<Vec<SyncEntity>>;

    async fn count(&self, kind: SyncableKind) -> Result<usize>;
}
