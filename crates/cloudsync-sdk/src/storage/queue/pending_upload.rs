//! 待上传队列表
//!
//! 键格式：`pending_upload:{luid:020}`，零填充保证字节序即 luid 顺序。
//! 不变式：同一 `(cloud_id, type)` 至多一条记录。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LuidGenerator;
use crate::error::Result;
use crate::storage::kv::KvStore;
use crate::sync::entity_sync::SyncableKind;

const PREFIX: &str = "pending_upload:";

/// 一条待上传的本地变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpload {
    /// 本地唯一 ID，决定批内上传顺序
    pub luid: u64,
    pub cloud_id: String,
    pub kind: SyncableKind,
    /// 入队（或最近一次刷新）时间，作为上行记录的版本号
    pub version: DateTime<Utc>,
    /// 入队时的 payload 快照；为空时在上传时从本地实体编码
    pub payload: Option<Vec<u8>>,
    pub removed: bool,
}

/// PendingUpload 持久化表
#[derive(Debug, Clone)]
pub struct PendingUploadStore {
    kv: Arc<KvStore>,
    luids: Arc<LuidGenerator>,
}

impl PendingUploadStore {
    pub fn new(kv: Arc<KvStore>, luids: Arc<LuidGenerator>) -> Self {
        Self { kv, luids }
    }

    fn key(luid: u64) -> String {
        format!("{}{:020}", PREFIX, luid)
    }

    pub fn next_luid(&self) -> Result<u64> {
        self.luids.next_luid()
    }

    /// 写入（新增或覆盖同 luid 的记录）
    pub async fn put(&self, upload: &PendingUpload) -> Result<()> {
        self.kv.set(Self::key(upload.luid), upload).await
    }

    pub async fn get(&self, luid: u64) -> Result<Option<PendingUpload>> {
        self.kv.get(Self::key(luid)).await
    }

    /// 全部待上传记录，按 luid 升序
    pub async fn list(&self) -> Result<Vec<PendingUpload>> {
        let items = self.kv.scan_prefix::<PendingUpload>(PREFIX.as_bytes()).await?;
        Ok(items.into_iter().map(|(_, upload)| upload).collect())
    }

    pub async fn find(&self, kind: SyncableKind, cloud_id: &str) -> Result<Option<PendingUpload>> {
        let all = self.list().await?;
        Ok(all.into_iter().find(|u| u.kind == kind && u.cloud_id == cloud_id))
    }

    /// 任意类型下该 cloud_id 的记录（远端删除时用）
    pub async fn find_by_cloud_id(&self, cloud_id: &str) -> Result<Vec<PendingUpload>> {
        let all = self.list().await?;
        Ok(all.into_iter().filter(|u| u.cloud_id == cloud_id).collect())
    }

    pub async fn dequeue(&self, luid: u64) -> Result<bool> {
        self.kv.delete(Self::key(luid)).await
    }

    /// 仅当记录在上传期间没有被新的本地变更覆盖时才出队
    pub async fn dequeue_if_unchanged(&self, uploaded: &PendingUpload) -> Result<bool> {
        match self.get(uploaded.luid).await? {
            Some(current) if current.version == uploaded.version && current.removed == uploaded.removed => {
                self.dequeue(uploaded.luid).await
            }
            _ => Ok(false),
        }
    }

    pub async fn count(&self) -> Result<usize> {
        self.kv.count_prefix(PREFIX.as_bytes()).await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.kv.remove_prefix(PREFIX.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> PendingUploadStore {
        let kv = Arc::new(KvStore::open(dir.path(), "test_zone").await.unwrap());
        PendingUploadStore::new(kv, Arc::new(LuidGenerator::new().unwrap()))
    }

    fn upload(store: &PendingUploadStore, cloud_id: &str, kind: SyncableKind) -> PendingUpload {
        PendingUpload {
            luid: store.next_luid().unwrap(),
            cloud_id: cloud_id.to_string(),
            kind,
            version: Utc::now(),
            payload: None,
            removed: false,
        }
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_luid() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let first = upload(&store, "a", SyncableKind::Message);
        let second = upload(&store, "b", SyncableKind::Conversation);
        store.put(&second).await.unwrap();
        store.put(&first).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![first.clone(), second]);
        assert_eq!(store.find(SyncableKind::Message, "a").await.unwrap(), Some(first));
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dequeue_if_unchanged_respects_newer_version() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let original = upload(&store, "a", SyncableKind::Conversation);
        store.put(&original).await.unwrap();

        // 上传进行中，本地又产生了新的变更
        let mut refreshed = original.clone();
        refreshed.version = original.version + chrono::Duration::seconds(1);
        store.put(&refreshed).await.unwrap();

        assert!(!store.dequeue_if_unchanged(&original).await.unwrap());
        assert!(store.dequeue_if_unchanged(&refreshed).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let pending = {
            let store = store(&dir).await;
            let pending = upload(&store, "a", SyncableKind::ModelConfig);
            store.put(&pending).await.unwrap();
            store.kv.flush().await.unwrap();
            pending
        };

        let reopened = store(&dir).await;
        assert_eq!(reopened.list().await.unwrap(), vec![pending]);
    }
}
