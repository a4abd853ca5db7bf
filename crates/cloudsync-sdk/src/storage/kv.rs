//! KV 存储模块 - 基于 sled 的同步元数据存储
//!
//! 本模块保存所有需要跨进程重启存活的同步状态：
//! - 增量拉取游标（change token）
//! - 待上传队列（PendingUpload）与延迟依赖队列（DeferredRecord）
//! - 设备 ID、首次初始化标记、压缩时间戳等小状态
//!
//! 每个同步容器（账号 / zone）使用独立的 sled Tree 隔离。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{CloudSyncError, Result};
use crate::storage::KvStats;

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    base_path: PathBuf,
    db: Arc<Db>,
    /// 当前命名空间对应的 Tree
    tree: Tree,
    namespace: String,
}

impl KvStore {
    /// 打开（或创建）`{base_path}/kv` 下的 sled 数据库，并进入指定命名空间
    pub async fn open(base_path: &Path, namespace: &str) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| CloudSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个进程 / 实例可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            CloudSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = Self::open_tree(&db, namespace)?;
        tracing::info!("KV 命名空间已打开: {}", namespace);

        Ok(Self {
            base_path,
            db: Arc::new(db),
            tree,
            namespace: namespace.to_string(),
        })
    }

    fn open_tree(db: &Db, namespace: &str) -> Result<Tree> {
        db.open_tree(format!("sync_{}", namespace))
            .map_err(|e| CloudSyncError::KvStore(format!("打开命名空间 Tree 失败: {}", e)))
    }

    /// 在同一个 sled 实例上打开另一个命名空间
    pub fn namespace(&self, namespace: &str) -> Result<Self> {
        Ok(Self {
            base_path: self.base_path.clone(),
            db: self.db.clone(),
            tree: Self::open_tree(&self.db, namespace)?,
            namespace: namespace.to_string(),
        })
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace
    }

    /// 设置键值对（值使用 JSON 编码）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| CloudSyncError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree
            .insert(key, value_bytes)
            .map_err(|e| CloudSyncError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| CloudSyncError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| CloudSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对，返回是否存在过
    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let result = self
            .tree
            .remove(key)
            .map_err(|e| CloudSyncError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.is_some())
    }

    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .contains_key(key)
            .map_err(|e| CloudSyncError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 批量设置键值对（原子）
    pub async fn set_batch<K, V>(&self, pairs: Vec<(K, V)>) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let mut batch = sled::Batch::default();

        for (key, value) in pairs {
            let value_bytes = serde_json::to_vec(&value)
                .map_err(|e| CloudSyncError::Serialization(format!("序列化值失败: {}", e)))?;
            batch.insert(key.as_ref(), value_bytes);
        }

        self.tree
            .apply_batch(batch)
            .map_err(|e| CloudSyncError::KvStore(format!("批量设置失败: {}", e)))?;

        Ok(())
    }

    /// 获取指定前缀的所有键值对（按键字节序）
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();

        for result in self.tree.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| CloudSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| CloudSyncError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 统计指定前缀下的键数量
    pub async fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut count = 0usize;
        for result in self.tree.scan_prefix(prefix).keys() {
            result.map_err(|e| CloudSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            count += 1;
        }
        Ok(count)
    }

    /// 删除指定前缀下的所有键，返回删除数量
    pub async fn remove_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;

        for result in self.tree.scan_prefix(prefix).keys() {
            let key = result
                .map_err(|e| CloudSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            batch.remove(key);
            removed += 1;
        }

        self.tree
            .apply_batch(batch)
            .map_err(|e| CloudSyncError::KvStore(format!("批量删除失败: {}", e)))?;

        Ok(removed)
    }

    /// 将脏页刷到磁盘
    pub async fn flush(&self) -> Result<()> {
        self.tree
            .flush_async()
            .await
            .map_err(|e| CloudSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<KvStats> {
        let key_count = self.tree.len() as u64;
        let storage_size = self
            .db
            .size_on_disk()
            .map_err(|e| CloudSyncError::KvStore(format!("读取磁盘占用失败: {}", e)))?;

        Ok(KvStats {
            key_count,
            storage_size,
        })
    }
}
