//! 延迟依赖队列表
//!
//! 键格式：`deferred_record:{record_name}`。
//! 不变式：`retry_count <= 10`；超过 7 天未处理的条目无条件清理（由上层触发）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::kv::KvStore;

const PREFIX: &str = "deferred_record:";

/// 一条暂存的入站记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredRecord {
    /// 远端记录 ID
    pub record_name: String,
    /// bincode 编码的 `RemoteRecord`
    pub serialized_record: Vec<u8>,
    pub retry_count: u32,
    pub last_attempt: DateTime<Utc>,
}

/// DeferredRecord 持久化表
#[derive(Debug, Clone)]
pub struct DeferredRecordStore {
    kv: Arc<KvStore>,
}

impl DeferredRecordStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn key(record_name: &str) -> String {
        format!("{}{}", PREFIX, record_name)
    }

    pub async fn put(&self, record: &DeferredRecord) -> Result<()> {
        self.kv.set(Self::key(&record.record_name), record).await
    }

    pub async fn get(&self, record_name: &str) -> Result<Option<DeferredRecord>> {
        self.kv.get(Self::key(record_name)).await
    }

    /// 全部条目，按 last_attempt 升序（最久未尝试的先处理）
    pub async fn list(&self) -> Result<Vec<DeferredRecord>> {
        let items = self.kv.scan_prefix::<DeferredRecord>(PREFIX.as_bytes()).await?;
        let mut records: Vec<DeferredRecord> = items.into_iter().map(|(_, r)| r).collect();
        records.sort_by(|a, b| a.last_attempt.cmp(&b.last_attempt));
        Ok(records)
    }

    pub async fn remove(&self, record_name: &str) -> Result<bool> {
        self.kv.delete(Self::key(record_name)).await
    }

    /// 删除 last_attempt 早于 cutoff 的条目，返回删除数量
    pub async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0usize;
        for record in self.list().await? {
            if record.last_attempt < cutoff && self.remove(&record.record_name).await? {
                removed += 1;
            }
        }
        Ok(removed)
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
    use chrono::Duration;
    use tempfile::TempDir;

    fn deferred(name: &str, last_attempt: DateTime<Utc>) -> DeferredRecord {
        DeferredRecord {
            record_name: name.to_string(),
            serialized_record: vec![1, 2, 3],
            retry_count: 0,
            last_attempt,
        }
    }

    #[tokio::test]
    async fn test_list_orders_by_last_attempt() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::open(dir.path(), "test_zone").await.unwrap());
        let store = DeferredRecordStore::new(kv);
        let now = Utc::now();

        store.put(&deferred("b", now)).await.unwrap();
        store.put(&deferred("a", now - Duration::minutes(5))).await.unwrap();

        let names: Vec<String> = store.list().await.unwrap().into_iter().map(|r| r.record_name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_older_than() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::open(dir.path(), "test_zone").await.unwrap());
        let store = DeferredRecordStore::new(kv);
        let now = Utc::now();

        store.put(&deferred("stale", now - Duration::days(8))).await.unwrap();
        store.put(&deferred("fresh", now - Duration::days(1))).await.unwrap();

        assert_eq!(store.remove_older_than(now - Duration::days(7)).await.unwrap(), 1);
        assert!(store.get("stale").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());
    }
}
