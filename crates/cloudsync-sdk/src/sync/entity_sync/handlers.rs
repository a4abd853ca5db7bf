//! 按实体类型分发的处理函数表
//!
//! 每种 `SyncableKind` 对应一组 `{encode, decode, apply_upsert, apply_delete}`，
//! 每条记录只查一次表。

use async_trait::async_trait;

use super::payload::{AttachmentPayload, ConversationPayload, MessagePayload, ModelConfigPayload, SyncPayload};
use super::SyncableKind;
use crate::error::{CloudSyncError, Result};
use crate::storage::entities::SyncEntity;
use crate::storage::local_store::LocalStore;

#[async_trait]
pub trait KindHandler: Send + Sync {
    fn kind(&self) -> SyncableKind;

    /// 本地实体 → payload；父实体还没有 cloud_id 时返回 `DependencyMissing`
    async fn encode(&self, local: &dyn LocalStore, entity: &SyncEntity) -> Result<SyncPayload>;

    fn decode(&self, bytes: &[u8]) -> Result<SyncPayload> {
        SyncPayload::decode(self.kind(), bytes)
    }

    /// 写入远端版本；本地缺少父实体时返回 `DependencyMissing`
    async fn apply_upsert(
        &self,
        local: &dyn LocalStore,
        cloud_id: &str,
        existing: Option<&SyncEntity>,
        payload: SyncPayload,
    ) -> Result<()>;

    /// 父实体本地缺失时返回 `DependencyMissing`，在冲突判定之前调用
    async fn ensure_parent(&self, local: &dyn LocalStore, payload: &SyncPayload) -> Result<()> {
        match payload.parent_ref() {
            Some((kind, parent_cloud_id, field)) => resolve_parent(local, kind, parent_cloud_id, field).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn apply_delete(&self, local: &dyn LocalStore, cloud_id: &str) -> Result<bool> {
        local.remove(self.kind(), cloud_id).await
    }
}

/// 实体的父实体（类型 + 本地主键）
pub fn parent_local_id(entity: &SyncEntity) -> Option<(SyncableKind, i64)> {
    match entity {
        SyncEntity::Message(m) => Some((SyncableKind::Conversation, m.conversation_id)),
        SyncEntity::Attachment(a) => Some((SyncableKind::Message, a.message_id)),
        SyncEntity::Conversation(_) | SyncEntity::ModelConfig(_) => None,
    }
}

/// 上行时取父实体 cloud_id
async fn parent_cloud_id(local: &dyn LocalStore, entity: &SyncEntity) -> Result<String> {
    let (kind, local_id) = match parent_local_id(entity) {
        Some(parent) => parent,
        None => return Ok(String::new()),
    };
    match local.find_by_local_id(kind, local_id).await? {
        Some(parent) if !parent.cloud_id().is_empty() => Ok(parent.cloud_id().to_string()),
        Some(_) => Err(CloudSyncError::DependencyMissing(format!(
            "{} #{} 尚未分配 cloud_id",
            kind, local_id
        ))),
        None => Err(CloudSyncError::NotFound(format!(
            "{} {} 的父实体 {} #{} 不存在",
            entity.kind(),
            entity.cloud_id(),
            kind,
            local_id
        ))),
    }
}

/// 入站时按父实体 cloud_id 找本地主键
async fn resolve_parent(local: &dyn LocalStore, kind: SyncableKind, parent_cloud_id: &str, field: &str) -> Result<i64> {
    if parent_cloud_id.is_empty() {
        return Err(CloudSyncError::RecordDataMissing(field.to_string()));
    }
    match local.find_by_cloud_id(kind, parent_cloud_id).await? {
        Some(parent) => parent
            .local_id()
            .ok_or_else(|| CloudSyncError::InvalidData(format!("{} {} 缺少本地主键", kind, parent_cloud_id))),
        None => Err(CloudSyncError::DependencyMissing(format!("{} {}", kind, parent_cloud_id))),
    }
}

fn existing_id(existing: Option<&SyncEntity>) -> i64 {
    existing.and_then(|e| e.local_id()).unwrap_or(0)
}

fn mismatched(kind: SyncableKind, payload: &SyncPayload) -> CloudSyncError {
    tracing::warn!("{} 处理器收到 {} payload", kind, payload.kind());
    CloudSyncError::RecordDataMissing("payload".to_string())
}

// ============================================================
// 四种实体
// ============================================================

pub struct ConversationHandler;
pub struct MessageHandler;
pub struct AttachmentHandler;
pub struct ModelConfigHandler;

#[async_trait]
impl KindHandler for ConversationHandler {
    fn kind(&self) -> SyncableKind {
        SyncableKind::Conversation
    }

    async fn encode(&self, _local: &dyn LocalStore, entity: &SyncEntity) -> Result<SyncPayload> {
        match entity {
            SyncEntity::Conversation(c) => Ok(SyncPayload::Conversation(ConversationPayload::from_entity(c))),
            other => Err(CloudSyncError::InvalidData(format!("期望 conversation，实际 {}", other.kind()))),
        }
    }

    async fn apply_upsert(
        &self,
        local: &dyn LocalStore,
        cloud_id: &str,
        existing: Option<&SyncEntity>,
        payload: SyncPayload,
    ) -> Result<()> {
        let payload = match payload {
            SyncPayload::Conversation(p) => p,
            other => return Err(mismatched(self.kind(), &other)),
        };
        let conversation = payload.into_entity(existing_id(existing), cloud_id);
        local.upsert(conversation.into()).await?;
        Ok(())
    }
}

#[async_trait]
impl KindHandler for MessageHandler {
    fn kind(&self) -> SyncableKind {
        SyncableKind::Message
    }

    async fn encode(&self, local: &dyn LocalStore, entity: &SyncEntity) -> Result<SyncPayload> {
        match entity {
            SyncEntity::Message(m) => {
                let conversation_cloud_id = parent_cloud_id(local, entity).await?;
                Ok(SyncPayload::Message(MessagePayload::from_entity(m, &conversation_cloud_id)))
            }
            other => Err(CloudSyncError::InvalidData(format!("期望 message，实际 {}", other.kind()))),
        }
    }

    async fn apply_upsert(
        &self,
        local: &dyn LocalStore,
        cloud_id: &str,
        existing: Option<&SyncEntity>,
        payload: SyncPayload,
    ) -> Result<()> {
        let payload = match payload {
            SyncPayload::Message(p) => p,
            other => return Err(mismatched(self.kind(), &other)),
        };
        let conversation_id = resolve_parent(
            local,
            SyncableKind::Conversation,
            &payload.conversation_cloud_id,
            "conversationCloudId",
        )
        .await?;
        let message = payload.into_entity(existing_id(existing), cloud_id, conversation_id);
        local.upsert(message.into()).await?;
        Ok(())
    }
}

#[async_trait]
impl KindHandler for AttachmentHandler {
    fn kind(&self) -> SyncableKind {
        SyncableKind::Attachment
    }

    async fn encode(&self, local: &dyn LocalStore, entity: &SyncEntity) -> Result<SyncPayload> {
        match entity {
            SyncEntity::Attachment(a) => {
                let message_cloud_id = parent_cloud_id(local, entity).await?;
                Ok(SyncPayload::Attachment(AttachmentPayload::from_entity(a, &message_cloud_id)))
            }
            other => Err(CloudSyncError::InvalidData(format!("期望 attachment，实际 {}", other.kind()))),
        }
    }

    async fn apply_upsert(
        &self,
        local: &dyn LocalStore,
        cloud_id: &str,
        existing: Option<&SyncEntity>,
        payload: SyncPayload,
    ) -> Result<()> {
        let payload = match payload {
            SyncPayload::Attachment(p) => p,
            other => return Err(mismatched(self.kind(), &other)),
        };
        let message_id =
            resolve_parent(local, SyncableKind::Message, &payload.message_cloud_id, "messageCloudId").await?;
        let attachment = payload.into_entity(existing_id(existing), cloud_id, message_id);
        local.upsert(attachment.into()).await?;
        Ok(())
    }
}

#[async_trait]
impl KindHandler for ModelConfigHandler {
    fn kind(&self) -> SyncableKind {
        SyncableKind::ModelConfig
    }

    async fn encode(&self, _local: &dyn LocalStore, entity: &SyncEntity) -> Result<SyncPayload> {
        match entity {
            SyncEntity::ModelConfig(m) => Ok(SyncPayload::ModelConfig(ModelConfigPayload::from_entity(m))),
            other => Err(CloudSyncError::InvalidData(format!("期望 model，实际 {}", other.kind()))),
        }
    }

    async fn apply_upsert(
        &self,
        local: &dyn LocalStore,
        cloud_id: &str,
        _existing: Option<&SyncEntity>,
        payload: SyncPayload,
    ) -> Result<()> {
        let payload = match payload {
            SyncPayload::ModelConfig(p) => p,
            other => return Err(mismatched(self.kind(), &other)),
        };
        local.upsert(payload.into_entity(cloud_id).into()).await?;
        Ok(())
    }
}

static CONVERSATION_HANDLER: ConversationHandler = ConversationHandler;
static MESSAGE_HANDLER: MessageHandler = MessageHandler;
static ATTACHMENT_HANDLER: AttachmentHandler = AttachmentHandler;
static MODEL_CONFIG_HANDLER: ModelConfigHandler = ModelConfigHandler;

/// 查表
pub fn handler_for(kind: SyncableKind) -> &'static dyn KindHandler {
    match kind {
        SyncableKind::Conversation => &CONVERSATION_HANDLER,
        SyncableKind::Message => &MESSAGE_HANDLER,
        SyncableKind::Attachment => &ATTACHMENT_HANDLER,
        SyncableKind::ModelConfig => &MODEL_CONFIG_HANDLER,
    }
}
