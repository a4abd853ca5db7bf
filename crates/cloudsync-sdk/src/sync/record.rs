//! 线上记录格式（SyncObject）
//!
//! `{cloudId, type, version, removed, originDevice, payload?}`；
//! `payload` 仅在 `removed == false` 时存在。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CloudSyncError, Result};
use crate::sync::entity_sync::SyncableKind;

/// 同步记录
///
/// 入站记录来自远端，字段可能缺失，所以 `version` / `origin_device` 为 Option，
/// `record_type` 保留原始字符串，由下载管线校验。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub cloud_id: String,
    pub record_type: String,
    pub version: Option<DateTime<Utc>>,
    pub removed: bool,
    pub origin_device: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl SyncRecord {
    /// 上行：普通记录
    pub fn live(
        cloud_id: impl Into<String>,
        kind: SyncableKind,
        version: DateTime<Utc>,
        origin_device: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            cloud_id: cloud_id.into(),
            record_type: kind.as_str().to_string(),
            version: Some(version),
            removed: false,
            origin_device: Some(origin_device.into()),
            payload: Some(payload),
        }
    }

    /// 上行：删除标记（tombstone）
    pub fn tombstone(
        cloud_id: impl Into<String>,
        kind: SyncableKind,
        version: DateTime<Utc>,
        origin_device: impl Into<String>,
    ) -> Self {
        Self {
            cloud_id: cloud_id.into(),
            record_type: kind.as_str().to_string(),
            version: Some(version),
            removed: true,
            origin_device: Some(origin_device.into()),
            payload: None,
        }
    }

    /// 非空的来源设备 ID
    pub fn origin(&self) -> Option<&str> {
        self.origin_device.as_deref().filter(|d| !d.is_empty())
    }
}

/// 远端存储中的一条记录：记录 ID + 内容
///
/// 通过本 SDK 写入的记录 `record_id == cloud_id`；历史副本可能拥有不同的记录 ID，
/// 压缩时按 `record.cloud_id` 分组。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_id: String,
    pub record: SyncRecord,
}

impl RemoteRecord {
    pub fn new(record: SyncRecord) -> Self {
        Self {
            record_id: record.cloud_id.clone(),
            record,
        }
    }

    /// 延迟队列使用的紧凑编码
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CloudSyncError::Serialization(format!("编码远端记录失败: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| CloudSyncError::Serialization(format!("解码远端记录失败: {}", e)))
    }
}
