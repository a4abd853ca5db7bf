//! 远端记录存储接口
//!
//! 远端被视为不透明服务，同步引擎只通过 `RemoteStore` 访问：
//! - zone（分区）的创建
//! - 数据库级 / zone 级增量变更拉取（分页，调用方循环拉取）
//! - 批量保存 / 删除记录
//! - 条件查询（压缩使用）
//! - 推送订阅

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::collections::HashMap;
use std::time::Duration;

use crate::sync::record::{RemoteRecord, SyncRecord};

pub use memory::InMemoryRemoteStore;

pub type ZoneId = String;

/// 不透明的增量游标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeToken(pub Vec<u8>);

/// 数据库级变更页
#[derive(Debug, Clone, Default)]
pub struct DatabaseChanges {
    pub changed_zones: Vec<ZoneId>,
    pub deleted_zones: Vec<ZoneId>,
    pub new_token: Option<ChangeToken>,
    pub has_more: bool,
}

/// zone 级变更页
#[derive(Debug, Clone, Default)]
pub struct ZoneChanges {
    pub records: Vec<RemoteRecord>,
    /// 被删除的记录 ID
    pub deleted_record_ids: Vec<String>,
    pub new_token: Option<ChangeToken>,
    pub has_more: bool,
}

/// 批量保存结果：成功的记录 ID + 逐条错误
#[derive(Debug, Clone, Default)]
pub struct SaveResult {
    pub saved: Vec<String>,
    pub errors: HashMap<String, RemoteError>,
}

/// 查询分页游标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor(pub Vec<u8>);

/// 记录查询条件：版本早于 `older_than` 的记录，按版本升序
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub older_than: DateTime<Utc>,
    pub limit: usize,
    pub cursor: Option<QueryCursor>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<RemoteRecord>,
    pub next_cursor: Option<QueryCursor>,
}

/// 订阅范围
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionScope {
    Database,
    Zone(ZoneId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub scope: SubscriptionScope,
}

/// 上传遇到远端错误时的处置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDisposition {
    /// 远端版本已变化：不覆盖，触发下载对齐，条目保留
    Reconcile,
    /// 暂时性错误：条目保留等待下一轮
    Keep,
    /// 不可重试：丢弃条目，避免无限重试
    Drop,
}

/// 远端错误分类
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("server record changed")]
    ServerRecordChanged,
    #[error("request rate limited")]
    RequestRateLimited { retry_after_secs: Option<u64> },
    #[error("zone busy")]
    ZoneBusy,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("network failure")]
    NetworkFailure,
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("limit exceeded")]
    LimitExceeded,
    #[error("zone not found: {0}")]
    ZoneNotFound(String),
    #[error("request timed out")]
    Timeout,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("permission failure")]
    PermissionFailure,
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// 是否可以退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::ServiceUnavailable
                | RemoteError::NetworkFailure
                | RemoteError::NetworkUnavailable
                | RemoteError::ZoneBusy
                | RemoteError::RequestRateLimited { .. }
                | RemoteError::Timeout
        )
    }

    /// 上传场景的处置
    pub fn upload_disposition(&self) -> UploadDisposition {
        match self {
            RemoteError::ServerRecordChanged => UploadDisposition::Reconcile,
            RemoteError::QuotaExceeded | RemoteError::LimitExceeded => UploadDisposition::Keep,
            e if e.is_retryable() => UploadDisposition::Keep,
            _ => UploadDisposition::Drop,
        }
    }

    /// 远端建议的最小等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RequestRateLimited { retry_after_secs: Some(secs) } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// 远端记录存储
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 确保 zone 存在；返回是否为新创建
    async fn create_zone(&self, zone: &str) -> RemoteResult<bool>;

    /// 拉取一页数据库级变更
    async fn fetch_database_changes(&self, token: Option<&ChangeToken>) -> RemoteResult<DatabaseChanges>;

    /// 拉取某个 zone 的一页记录变更
    async fn fetch_zone_changes(&self, zone: &str, token: Option<&ChangeToken>) -> RemoteResult<ZoneChanges>;

    /// 批量保存记录（以 cloud_id 作为记录 ID）
    async fn save_records(&self, zone: &str, records: Vec<SyncRecord>) -> RemoteResult<SaveResult>;

    /// 批量删除记录
    async fn delete_records(&self, zone: &str, record_ids: &[String]) -> RemoteResult<()>;

    /// 条件查询（分页）
    async fn query(&self, zone: &str, query: &RecordQuery) -> RemoteResult<QueryPage>;

    async fn list_subscriptions(&self) -> RemoteResult<Vec<Subscription>>;

    async fn subscribe(&self, subscription: Subscription) -> RemoteResult<()>;

    async fn unsubscribe(&self, subscription_id: &str) -> RemoteResult<()>;
}
