//! 本地实体定义
//!
//! 四类可同步实体：会话、消息、附件、模型配置。
//! - 本地主键 `id` 只在本设备有意义（模型配置直接以 cloud_id 为主键）
//! - `cloud_id` 是跨设备稳定 ID，创建时分配，之后不再改变
//! - `last_modified` 作为版本号参与冲突判定
//! - 父子关系在本地用本地主键表达，上行时换成父实体的 cloud_id

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::entity_sync::SyncableKind;

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// 本地主键，0 表示尚未落库
    pub id: i64,
    pub cloud_id: String,
    pub title: String,
    pub creation: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// 图标（PNG/JPEG 字节）
    pub icon: Vec<u8>,
    pub is_favorite: bool,
    pub should_auto_rename: bool,
    pub model_id: Option<String>,
}

impl Conversation {
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            cloud_id: String::new(),
            title: title.into(),
            creation: now,
            last_modified: now,
            icon: Vec::new(),
            is_favorite: false,
            should_auto_rename: true,
            model_id: None,
        }
    }
}

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
    Hint,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Hint => "hint",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            "hint" => Self::Hint,
            _ => Self::User,
        }
    }
}

/// 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub cloud_id: String,
    /// 所属会话的本地主键
    pub conversation_id: i64,
    pub creation: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub role: MessageRole,
    pub document: String,
    pub reasoning_content: String,
    /// 思考耗时（秒）
    pub thinking_duration: f64,
    pub is_thinking_fold: bool,
}

impl Message {
    pub fn new(conversation_id: i64, role: MessageRole, document: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            cloud_id: String::new(),
            conversation_id,
            creation: now,
            last_modified: now,
            role,
            document: document.into(),
            reasoning_content: String::new(),
            thinking_duration: 0.0,
            is_thinking_fold: false,
        }
    }
}

/// 附件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub cloud_id: String,
    /// 所属消息的本地主键
    pub message_id: i64,
    pub last_modified: DateTime<Utc>,
    pub data: Vec<u8>,
    pub preview_image_data: Vec<u8>,
    pub image_representation: Vec<u8>,
    pub represented_document: String,
    pub attachment_type: String,
    pub name: String,
    pub storage_suffix: String,
    pub object_identifier: String,
}

impl Attachment {
    pub fn new(message_id: i64, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            cloud_id: String::new(),
            message_id,
            last_modified: now,
            data: Vec::new(),
            preview_image_data: Vec::new(),
            image_representation: Vec::new(),
            represented_document: String::new(),
            attachment_type: String::new(),
            name: name.into(),
            storage_suffix: String::new(),
            object_identifier: String::new(),
        }
    }
}

/// 模型配置（以 cloud_id 为主键）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub cloud_id: String,
    pub model_identifier: String,
    pub model_list_endpoint: String,
    pub creation: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub endpoint: String,
    pub token: String,
    pub headers: BTreeMap<String, String>,
    pub capabilities: BTreeSet<String>,
    pub context_length: u32,
    pub comment: String,
}

impl ModelConfig {
    pub fn new(model_identifier: impl Into<String>, endpoint: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            cloud_id: String::new(),
            model_identifier: model_identifier.into(),
            model_list_endpoint: String::new(),
            creation: now,
            last_modified: now,
            endpoint: endpoint.into(),
            token: String::new(),
            headers: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            context_length: 0,
            comment: String::new(),
        }
    }
}

/// 任意一种可同步实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEntity {
    Conversation(Conversation),
    Message(Message),
    Attachment(Attachment),
    ModelConfig(ModelConfig),
}

impl SyncEntity {
    pub fn kind(&self) -> SyncableKind {
        match self {
            Self::Conversation(_) => SyncableKind::Conversation,
            Self::Message(_) => SyncableKind::Message,
            Self::Attachment(_) => SyncableKind::Attachment,
            Self::ModelConfig(_) => SyncableKind::ModelConfig,
        }
    }

    pub fn cloud_id(&self) -> &str {
        match self {
            Self::Conversation(c) => &c.cloud_id,
            Self::Message(m) => &m.cloud_id,
            Self::Attachment(a) => &a.cloud_id,
            Self::ModelConfig(m) => &m.cloud_id,
        }
    }

    pub fn set_cloud_id(&mut self, cloud_id: String) {
        match self {
            Self::Conversation(c) => c.cloud_id = cloud_id,
            Self::Message(m) => m.cloud_id = cloud_id,
            Self::Attachment(a) => a.cloud_id = cloud_id,
            Self::ModelConfig(m) => m.cloud_id = cloud_id,
        }
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        match self {
            Self::Conversation(c) => c.last_modified,
            Self::Message(m) => m.last_modified,
            Self::Attachment(a) => a.last_modified,
            Self::ModelConfig(m) => m.last_modified,
        }
    }

    /// 本地主键；模型配置没有数值主键
    pub fn local_id(&self) -> Option<i64> {
        match self {
            Self::Conversation(c) => Some(c.id),
            Self::Message(m) => Some(m.id),
            Self::Attachment(a) => Some(a.id),
            Self::ModelConfig(_) => None,
        }
    }
}

impl From<Conversation> for SyncEntity {
    fn from(value: Conversation) -> Self {
        Self::Conversation(value)
    }
}

impl From<Message> for SyncEntity {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<Attachment> for SyncEntity {
    fn from(value: Attachment) -> Self {
        Self::Attachment(value)
    }
}

impl From<ModelConfig> for SyncEntity {
    fn from(value: ModelConfig) -> Self {
        Self::ModelConfig(value)
    }
}

/// 本地变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalChangeType {
    Create,
    Update,
    Delete,
}

impl LocalChangeType {
    pub fn is_delete(self) -> bool {
        matches!(self, Self::Delete)
    }
}
