//! 错误类型定义
//!
//! 同步引擎的错误分为两层：
//! - `CloudSyncError`：SDK 对外统一错误（本地存储、序列化、记录校验等）
//! - `RemoteError`：远端记录存储返回的错误分类（见 `sync::remote`）

use thiserror::Error;

use crate::sync::entity_sync::SyncableKind;
use crate::sync::remote::RemoteError;

#[derive(Debug, Error)]
pub enum CloudSyncError {
    /// 入站记录缺少必填字段，永久错误，直接丢弃
    #[error("Record data missing: {0}")]
    RecordDataMissing(String),

    /// 未知的记录类型，直接丢弃
    #[error("Unsupported record type: {0}")]
    UnsupportedType(String),

    /// 父实体尚未同步到本地，进入延迟队列
    #[error("Dependency missing: {0}")]
    DependencyMissing(String),

    /// 本地实体序列化后超过上限，上传被丢弃且不再重试
    #[error("Payload too large: {kind} {cloud_id} ({size} bytes)")]
    PayloadTooLarge {
        kind: SyncableKind,
        cloud_id: String,
        size: usize,
    },

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl CloudSyncError {
    /// 是否为依赖缺失（需要延迟处理而不是丢弃）
    pub fn is_dependency_missing(&self) -> bool {
        matches!(self, CloudSyncError::DependencyMissing(_))
    }

    /// 是否值得交给 RetryScheduler 退避重试
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudSyncError::Remote(e) => e.is_retryable(),
            CloudSyncError::Timeout(_) => true,
            _ => false,
        }
    }

    /// 取出远端错误（如果是）
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            CloudSyncError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CloudSyncError {
    fn from(err: serde_json::Error) -> Self {
        CloudSyncError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for CloudSyncError {
    fn from(err: bincode::Error) -> Self {
        CloudSyncError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for CloudSyncError {
    fn from(err: sled::Error) -> Self {
        CloudSyncError::KvStore(err.to_string())
    }
}

impl From<std::io::Error> for CloudSyncError {
    fn from(err: std::io::Error) -> Self {
        CloudSyncError::IO(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CloudSyncError>;
