//! 内存本地存储
//!
//! 与 `SqliteLocalStore` 语义一致（本地主键自增、级联删除），
//! 用于测试替身以及不需要持久化实体的嵌入场景。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{CloudSyncError, Result};
use crate::storage::entities::{Attachment, Conversation, Message, ModelConfig, SyncEntity};
use crate::storage::local_store::LocalStore;
use crate::sync::entity_sync::SyncableKind;

#[derive(Debug, Default)]
struct Tables {
    conversations: BTreeMap<i64, Conversation>,
    messages: BTreeMap<i64, Message>,
    attachments: BTreeMap<i64, Attachment>,
    models: BTreeMap<String, ModelConfig>,
    next_id: i64,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove_message_cascade(&mut self, message_id: i64) {
        self.messages.remove(&message_id);
        self.attachments.retain(|_, a| a.message_id != message_id);
    }

    fn remove_conversation_cascade(&mut self, conversation_id: i64) {
        self.conversations.remove(&conversation_id);
        let message_ids: Vec<i64> = self
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.id)
            .collect();
        for id in message_ids {
            self.remove_message_cascade(id);
        }
    }
}

/// 内存实现的 LocalStore
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    tables: RwLock<Tables>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 在 BTreeMap 中按 cloud_id 查找本地主键
fn id_by_cloud_id<T>(map: &BTreeMap<i64, T>, cloud_id: &str, get: impl Fn(&T) -> &str) -> Option<i64> {
    if cloud_id.is_empty() {
        return None;
    }
    map.iter().find(|(_, v)| get(v) == cloud_id).map(|(id, _)| *id)
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn find_by_cloud_id(&self, kind: SyncableKind, cloud_id: &str) -> Result<Option<SyncEntity>> {
        if cloud_id.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read();
        let found = match kind {
            SyncableKind::Conversation => tables
                .conversations
                .values()
                .find(|c| c.cloud_id == cloud_id)
                .cloned()
                .map(SyncEntity::Conversation),
            SyncableKind::Message => tables
                .messages
                .values()
                .find(|m| m.cloud_id == cloud_id)
                .cloned()
                .map(SyncEntity::Message),
            SyncableKind::Attachment => tables
                .attachments
                .values()
                .find(|a| a.cloud_id == cloud_id)
                .cloned()
                .map(SyncEntity::Attachment),
            SyncableKind::ModelConfig => tables.models.get(cloud_id).cloned().map(SyncEntity::ModelConfig),
        };
        Ok(found)
    }

    async fn find_by_local_id(&self, kind: SyncableKind, local_id: i64) -> Result<Option<SyncEntity>> {
        let tables = self.tables.read();
        let found = match kind {
            SyncableKind::Conversation => tables.conversations.get(&local_id).cloned().map(SyncEntity::Conversation),
            SyncableKind::Message => tables.messages.get(&local_id).cloned().map(SyncEntity::Message),
            SyncableKind::Attachment => tables.attachments.get(&local_id).cloned().map(SyncEntity::Attachment),
            SyncableKind::ModelConfig => None,
        };
        Ok(found)
    }

    async fn upsert(&self, entity: SyncEntity) -> Result<SyncEntity> {
        let mut tables = self.tables.write();
        let saved = match entity {
            SyncEntity::Conversation(mut c) => {
                if c.id == 0 {
                    c.id = id_by_cloud_id(&tables.conversations, &c.cloud_id, |v| v.cloud_id.as_str())
                        .unwrap_or_else(|| tables.allocate_id());
                }
                tables.conversations.insert(c.id, c.clone());
                SyncEntity::Conversation(c)
            }
            SyncEntity::Message(mut m) => {
                if !tables.conversations.contains_key(&m.conversation_id) {
                    return Err(CloudSyncError::NotFound(format!("会话不存在: {}", m.conversation_id)));
                }
                if m.id == 0 {
                    m.id = id_by_cloud_id(&tables.messages, &m.cloud_id, |v| v.cloud_id.as_str())
                        .unwrap_or_else(|| tables.allocate_id());
                }
                tables.messages.insert(m.id, m.clone());
                SyncEntity::Message(m)
            }
            SyncEntity::Attachment(mut a) => {
                if !tables.messages.contains_key(&a.message_id) {
                    return Err(CloudSyncError::NotFound(format!("消息不存在: {}", a.message_id)));
                }
                if a.id == 0 {
                    a.id = id_by_cloud_id(&tables.attachments, &a.cloud_id, |v| v.cloud_id.as_str())
                        .unwrap_or_else(|| tables.allocate_id());
                }
                tables.attachments.insert(a.id, a.clone());
                SyncEntity::Attachment(a)
            }
            SyncEntity::ModelConfig(m) => {
                if m.cloud_id.is_empty() {
                    return Err(CloudSyncError::InvalidData("模型配置缺少 cloud_id".to_string()));
                }
                tables.models.insert(m.cloud_id.clone(), m.clone());
                SyncEntity::ModelConfig(m)
            }
        };
        Ok(saved)
    }

    async fn remove(&self, kind: SyncableKind, cloud_id: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let removed = match kind {
            SyncableKind::Conversation => {
                match id_by_cloud_id(&tables.conversations, cloud_id, |v| v.cloud_id.as_str()) {
                    Some(id) => {
                        tables.remove_conversation_cascade(id);
                        true
                    }
                    None => false,
                }
            }
            SyncableKind::Message => match id_by_cloud_id(&tables.messages, cloud_id, |v| v.cloud_id.as_str()) {
                Some(id) => {
                    tables.remove_message_cascade(id);
                    true
                }
                None => false,
            },
            SyncableKind::Attachment => match id_by_cloud_id(&tables.attachments, cloud_id, |v| v.cloud_id.as_str()) {
                Some(id) => tables.attachments.remove(&id).is_some(),
                None => false,
            },
            SyncableKind::ModelConfig => tables.models.remove(cloud_id).is_some(),
        };
        Ok(removed)
    }

    async fn list(&self, kind: SyncableKind) -> Result<Vec<SyncEntity>> {
        let tables = self.tables.read();
        let all = match kind {
            SyncableKind::Conversation => tables.conversations.values().cloned().map(SyncEntity::Conversation).collect(),
            SyncableKind::Message => tables.messages.values().cloned().map(SyncEntity::Message).collect(),
            SyncableKind::Attachment => tables.attachments.values().cloned().map(SyncEntity::Attachment).collect(),
            SyncableKind::ModelConfig => tables.models.values().cloned().map(SyncEntity::ModelConfig).collect(),
        };
        Ok(all)
    }

    async fn modified_since(&self, kind: SyncableKind, since: DateTime<Utc>) -> Result<Vec<SyncEntity>> {
        let all = self.list(kind).await?;
        Ok(all.into_iter().filter(|e| e.last_modified() >= since).collect())
    }

    async fn count(&self, kind: SyncableKind) -> Result<usize> {
        let tables = self.tables.read();
        let count = match kind {
            SyncableKind::Conversation => tables.conversations.len(),
            SyncableKind::Message => tables.messages.len(),
            SyncableKind::Attachment => tables.attachments.len(),
            SyncableKind::ModelConfig => tables.models.len(),
        };
        Ok(count)
    }
}
