//! 入站记录应用器 - 将远端 SyncRecord 写入本地实体表
//!
//! 每条记录依次经过：
//! 1. originDevice == 本机：回声，跳过
//! 2. 无 originDevice 但 30s 内本机刚上传过该 cloud_id：回声，跳过
//! 3. 必填字段校验（`RecordDataMissing`）与类型校验（`UnsupportedType`）
//! 4. 父实体缺失：`DependencyMissing`，由调用方转入延迟队列
//! 5. 本地已有版本时交给冲突判定，只有 UseRemote 才写入
//! 6. 墓碑对应的本地实体不存在时不算本地变更

use std::collections::HashSet;
use std::str::FromStr;

use tracing::debug;

use super::handlers::handler_for;
use super::SyncableKind;
use crate::error::{CloudSyncError, Result};
use crate::storage::local_store::LocalStore;
use crate::sync::conflict::{self, Resolution};
use crate::sync::record::RemoteRecord;

/// 本机近期上传记录查询
pub trait EchoFilter: Send + Sync {
    fn was_recently_uploaded(&self, cloud_id: &str) -> bool;
}

impl EchoFilter for HashSet<String> {
    fn was_recently_uploaded(&self, cloud_id: &str) -> bool {
        self.contains(cloud_id)
    }
}

/// 单条记录的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(SyncableKind),
    Removed(SyncableKind),
    KeptLocal(SyncableKind),
    /// 墓碑指向的实体本地本来就不存在
    AlreadyAbsent(SyncableKind),
    SkippedEcho,
    SkippedRecentUpload,
}

impl ApplyOutcome {
    /// 本地数据是否发生了变化
    pub fn changed_local(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_) | ApplyOutcome::Removed(_))
    }
}

pub struct RecordApplier<'a> {
    local: &'a dyn LocalStore,
    device_id: &'a str,
    echo: &'a dyn EchoFilter,
}

impl<'a> RecordApplier<'a> {
    pub fn new(local: &'a dyn LocalStore, device_id: &'a str, echo: &'a dyn EchoFilter) -> Self {
        Self { local, device_id, echo }
    }

    pub async fn apply(&self, remote: &RemoteRecord) -> Result<ApplyOutcome> {
        let record = &remote.record;

        match record.origin() {
            Some(origin) if origin == self.device_id => {
                debug!("跳过本机回声: {} {}", record.record_type, record.cloud_id);
                return Ok(ApplyOutcome::SkippedEcho);
            }
            None if self.echo.was_recently_uploaded(&record.cloud_id) => {
                debug!("跳过近期上传的回声: {} {}", record.record_type, record.cloud_id);
                return Ok(ApplyOutcome::SkippedRecentUpload);
            }
            _ => {}
        }

        if record.cloud_id.is_empty() {
            return Err(CloudSyncError::RecordDataMissing("cloudId".to_string()));
        }
        if record.record_type.is_empty() {
            return Err(CloudSyncError::RecordDataMissing("type".to_string()));
        }
        let version = record
            .version
            .ok_or_else(|| CloudSyncError::RecordDataMissing("version".to_string()))?;
        let kind = SyncableKind::from_str(&record.record_type)
            .map_err(|_| CloudSyncError::UnsupportedType(record.record_type.clone()))?;
        let handler = handler_for(kind);

        let payload = if record.removed {
            None
        } else {
            let bytes = record
                .payload
                .as_deref()
                .ok_or_else(|| CloudSyncError::RecordDataMissing("payload".to_string()))?;
            Some(handler.decode(bytes)?)
        };
        if let Some(payload) = &payload {
            handler.ensure_parent(self.local, payload).await?;
        }

        let existing = self.local.find_by_cloud_id(kind, &record.cloud_id).await?;
        if let Some(existing) = &existing {
            let resolution = conflict::resolve(existing.last_modified(), version, self.device_id, record.origin());
            if resolution == Resolution::KeepLocal {
                debug!(
                    "保留本地版本: {} {} (local={}, remote={}, origin={:?})",
                    kind,
                    record.cloud_id,
                    existing.last_modified(),
                    version,
                    record.origin()
                );
                return Ok(ApplyOutcome::KeptLocal(kind));
            }
        }

        match payload {
            None => {
                if handler.apply_delete(self.local, &record.cloud_id).await? {
                    Ok(ApplyOutcome::Removed(kind))
                } else {
                    debug!("本地不存在，忽略墓碑: {} {}", kind, record.cloud_id);
                    Ok(ApplyOutcome::AlreadyAbsent(kind))
                }
            }
            Some(payload) => {
                handler
                    .apply_upsert(self.local, &record.cloud_id, existing.as_ref(), payload)
                    .await?;
                Ok(ApplyOutcome::Applied(kind))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{Conversation, Message, MessageRole, SyncEntity};
    use crate::storage::MemoryLocalStore;
    use crate::sync::entity_sync::payload::{ConversationPayload, MessagePayload, SyncPayload};
    use crate::sync::record::SyncRecord;
    use chrono::{Duration, Utc};

    fn conversation_record(cloud_id: &str, title: &str, origin: &str, offset_secs: i64) -> RemoteRecord {
        let now = Utc::now() + Duration::seconds(offset_secs);
        let mut conversation = Conversation::new(title, now);
        conversation.cloud_id = cloud_id.to_string();
        let payload = SyncPayload::Conversation(ConversationPayload::from_entity(&conversation))
            .encode_checked(cloud_id)
            .unwrap();
        RemoteRecord::new(SyncRecord::live(cloud_id, SyncableKind::Conversation, now, origin, payload))
    }

    async fn title_of(store: &MemoryLocalStore, cloud_id: &str) -> Option<String> {
        match store.find_by_cloud_id(SyncableKind::Conversation, cloud_id).await.unwrap() {
            Some(SyncEntity::Conversation(c)) => Some(c.title),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_echo_from_own_device_is_skipped() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);

        let outcome = applier.apply(&conversation_record("c1", "t", "AAA", 0)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::SkippedEcho);
        assert_eq!(title_of(&store, "c1").await, None);

        let applier = RecordApplier::new(&store, "BBB", &echo);
        let outcome = applier.apply(&conversation_record("c1", "t", "AAA", 0)).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied(SyncableKind::Conversation));
        assert_eq!(title_of(&store, "c1").await.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_anonymous_echo_uses_recent_upload_cache() {
        let store = MemoryLocalStore::new();
        let mut echo = HashSet::new();
        echo.insert("c1".to_string());
        let applier = RecordApplier::new(&store, "AAA", &echo);

        let mut record = conversation_record("c1", "t", "", 0);
        record.record.origin_device = None;
        assert_eq!(applier.apply(&record).await.unwrap(), ApplyOutcome::SkippedRecentUpload);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);

        let mut record = conversation_record("c1", "t", "BBB", 0);
        record.record.version = None;
        assert!(matches!(
            applier.apply(&record).await,
            Err(CloudSyncError::RecordDataMissing(field)) if field == "version"
        ));

        let mut record = conversation_record("c1", "t", "BBB", 0);
        record.record.record_type = "folder".to_string();
        assert!(matches!(applier.apply(&record).await, Err(CloudSyncError::UnsupportedType(_))));

        let mut record = conversation_record("c1", "t", "BBB", 0);
        record.record.payload = None;
        assert!(matches!(
            applier.apply(&record).await,
            Err(CloudSyncError::RecordDataMissing(field)) if field == "payload"
        ));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);
        let record = conversation_record("c1", "same", "BBB", 0);

        applier.apply(&record).await.unwrap();
        let first = store.list(SyncableKind::Conversation).await.unwrap();
        applier.apply(&record).await.unwrap();
        let second = store.list(SyncableKind::Conversation).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_removes_local_entity() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);
        applier.apply(&conversation_record("c1", "t", "BBB", -10)).await.unwrap();

        let tombstone = RemoteRecord::new(SyncRecord::tombstone("c1", SyncableKind::Conversation, Utc::now(), "BBB"));
        assert_eq!(
            applier.apply(&tombstone).await.unwrap(),
            ApplyOutcome::Removed(SyncableKind::Conversation)
        );
        assert_eq!(title_of(&store, "c1").await, None);
    }

    #[tokio::test]
    async fn test_much_older_remote_keeps_local() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);

        let mut local = Conversation::new("local", Utc::now());
        local.cloud_id = "c1".to_string();
        store.upsert(local.into()).await.unwrap();

        let stale = conversation_record("c1", "stale", "BBB", -600);
        assert_eq!(
            applier.apply(&stale).await.unwrap(),
            ApplyOutcome::KeptLocal(SyncableKind::Conversation)
        );
        assert_eq!(title_of(&store, "c1").await.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_tombstone_for_unknown_entity_changes_nothing() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);

        let tombstone =
            RemoteRecord::new(SyncRecord::tombstone("never-seen", SyncableKind::Conversation, Utc::now(), "BBB"));
        let outcome = applier.apply(&tombstone).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyAbsent(SyncableKind::Conversation));
        assert!(!outcome.changed_local());
    }

    #[tokio::test]
    async fn test_missing_parent_wins_over_stale_version() {
        let store = MemoryLocalStore::new();
        let echo = HashSet::new();
        let applier = RecordApplier::new(&store, "AAA", &echo);

        let mut conversation = Conversation::new("local", Utc::now());
        conversation.cloud_id = "c-local".to_string();
        let conversation_id = store.upsert(conversation.into()).await.unwrap().local_id().unwrap();
        let mut local = Message::new(conversation_id, MessageRole::User, "local", Utc::now());
        local.cloud_id = "m1".to_string();
        store.upsert(local.into()).await.unwrap();

        let stale_at = Utc::now() - Duration::seconds(600);
        let mut remote = Message::new(conversation_id, MessageRole::User, "stale", stale_at);
        remote.cloud_id = "m1".to_string();
        let payload = SyncPayload::Message(MessagePayload::from_entity(&remote, "missing-conversation"))
            .encode_checked("m1")
            .unwrap();
        let record = RemoteRecord::new(SyncRecord::live("m1", SyncableKind::Message, stale_at, "BBB", payload));

        let err = applier.apply(&record).await.unwrap_err();
        assert!(err.is_dependency_missing());
    }
}
