//! 增量游标存储（ChangeTokenStore）
//!
//! 格式：change_token:database 或 change_token:zone:{zone}
//!
//! 每拉完一页就写一次，进程中途崩溃后从最近一页继续。

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::storage::kv::KvStore;
use crate::sync::remote::ChangeToken;

const PREFIX: &str = "change_token";

/// 游标范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope<'a> {
    Database,
    Zone(&'a str),
}

/// 持久化数据库级与 zone 级 change token
#[derive(Debug, Clone)]
pub struct ChangeTokenStore {
    kv: Arc<KvStore>,
}

impl ChangeTokenStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn key(scope: TokenScope<'_>) -> String {
        match scope {
            TokenScope::Database => format!("{}:database", PREFIX),
            TokenScope::Zone(zone) => format!("{}:zone:{}", PREFIX, zone),
        }
    }

    pub async fn get(&self, scope: TokenScope<'_>) -> Result<Option<ChangeToken>> {
        self.kv.get(Self::key(scope)).await
    }

    pub async fn set(&self, scope: TokenScope<'_>, token: &ChangeToken) -> Result<()> {
        debug!("更新游标 {} ({} bytes)", Self::key(scope), token.0.len());
        self.kv.set(Self::key(scope), token).await
    }

    pub async fn clear(&self, scope: TokenScope<'_>) -> Result<bool> {
        self.kv.delete(Self::key(scope)).await
    }

    /// 清空全部游标（zone 被删除时调用，下次拉取回到全量）
    pub async fn reset_all(&self) -> Result<usize> {
        let removed = self.kv.remove_prefix(format!("{}:", PREFIX).as_bytes()).await?;
        info!("🔄 已重置全部 change token: {} 个", removed);
        Ok(removed)
    }
}
