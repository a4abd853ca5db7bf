//! 记录 payload 编解码与体积保护
//!
//! payload 是带类型标签的 `SyncPayload`（bincode 编码），标签必须与记录的 `type` 一致。
//!
//! 上行体积限制：
//! - 会话图标 > 500KB：JPEG 质量 0.7 起每次降 0.1 重压，仍超限则换成默认图标
//! - 消息正文 > 800K 字符：截断并追加标记
//! - 附件二进制字段 > 200KB：置空，保留元数据
//! - 编码后整体 > 1MB：`PayloadTooLarge`（附件先退化为最小元数据 payload）

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CloudSyncError, Result};
use crate::storage::entities::{Attachment, Conversation, Message, MessageRole, ModelConfig};
use crate::sync::entity_sync::SyncableKind;

pub const MAX_ICON_BYTES: usize = 500_000;
pub const MAX_TEXT_CHARS: usize = 800_000;
pub const MAX_ATTACHMENT_BINARY_BYTES: usize = 200_000;
pub const MAX_REPRESENTED_DOCUMENT_CHARS: usize = 50_000;
pub const MAX_PAYLOAD_BYTES: usize = 1_000_000;

pub const DEFAULT_CONVERSATION_TITLE: &str = "Untitled Conversation";
const TEXT_TRUNCATED_MARKER: &str = "\n\n[Content truncated for sync]";
const DOCUMENT_TRUNCATED_MARKER: &str = "\n\n[Content truncated]";
const ATTACHMENT_TOO_LARGE: &str = "[Attachment too large for sync]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub title: String,
    pub creation: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub icon: Vec<u8>,
    pub is_favorite: bool,
    pub should_auto_rename: bool,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub conversation_cloud_id: String,
    pub creation: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub role: String,
    pub document: String,
    pub reasoning_content: String,
    pub thinking_duration: f64,
    pub is_thinking_fold: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub message_cloud_id: String,
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigPayload {
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

/// 带类型标签的 payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncPayload {
    Conversation(ConversationPayload),
    Message(MessagePayload),
    Attachment(AttachmentPayload),
    ModelConfig(ModelConfigPayload),
}

impl SyncPayload {
    pub fn kind(&self) -> SyncableKind {
        match self {
            Self::Conversation(_) => SyncableKind::Conversation,
            Self::Message(_) => SyncableKind::Message,
            Self::Attachment(_) => SyncableKind::Attachment,
            Self::ModelConfig(_) => SyncableKind::ModelConfig,
        }
    }

    /// 父实体引用：(类型, cloud_id, 字段名)
    pub fn parent_ref(&self) -> Option<(SyncableKind, &str, &'static str)> {
        match self {
            Self::Message(m) => Some((SyncableKind::Conversation, m.conversation_cloud_id.as_str(), "conversationCloudId")),
            Self::Attachment(a) => Some((SyncableKind::Message, a.message_cloud_id.as_str(), "messageCloudId")),
            Self::Conversation(_) | Self::ModelConfig(_) => None,
        }
    }

    /// 解码并校验类型标签；无法解码或标签不符都视为缺失 payload
    pub fn decode(expected: SyncableKind, bytes: &[u8]) -> Result<Self> {
        let payload: SyncPayload =
            bincode::deserialize(bytes).map_err(|_| CloudSyncError::RecordDataMissing("payload".to_string()))?;
        if payload.kind() != expected {
            warn!("payload 类型不符: 记录为 {}，payload 为 {}", expected, payload.kind());
            return Err(CloudSyncError::RecordDataMissing("payload".to_string()));
        }
        Ok(payload)
    }

    /// 编码并执行整体体积检查
    pub fn encode_checked(&self, cloud_id: &str) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() <= MAX_PAYLOAD_BYTES {
            return Ok(bytes);
        }

        if let SyncPayload::Attachment(attachment) = self {
            warn!(
                "⚠️ 附件 payload 过大 ({} bytes)，退化为元数据: {}",
                bytes.len(),
                cloud_id
            );
            let minimal = bincode::serialize(&SyncPayload::Attachment(attachment.minimal()))?;
            if minimal.len() <= MAX_PAYLOAD_BYTES {
                return Ok(minimal);
            }
        }

        Err(CloudSyncError::PayloadTooLarge {
            kind: self.kind(),
            cloud_id: cloud_id.to_string(),
            size: bytes.len(),
        })
    }
}

// ============================================================
// 实体 ↔ payload
// ============================================================

impl ConversationPayload {
    pub fn from_entity(conversation: &Conversation) -> Self {
        Self {
            title: conversation.title.clone(),
            creation: conversation.creation,
            last_modified: conversation.last_modified,
            icon: compress_icon(&conversation.icon),
            is_favorite: conversation.is_favorite,
            should_auto_rename: conversation.should_auto_rename,
            model_id: conversation.model_id.clone(),
        }
    }

    /// 入站：空标题 / 空图标回落到默认值
    pub fn into_entity(self, id: i64, cloud_id: &str) -> Conversation {
        Conversation {
            id,
            cloud_id: cloud_id.to_string(),
            title: if self.title.is_empty() {
                DEFAULT_CONVERSATION_TITLE.to_string()
            } else {
                self.title
            },
            creation: self.creation,
            last_modified: self.last_modified,
            icon: if self.icon.is_empty() { default_icon() } else { self.icon },
            is_favorite: self.is_favorite,
            should_auto_rename: self.should_auto_rename,
            model_id: self.model_id,
        }
    }
}

impl MessagePayload {
    pub fn from_entity(message: &Message, conversation_cloud_id: &str) -> Self {
        Self {
            conversation_cloud_id: conversation_cloud_id.to_string(),
            creation: message.creation,
            last_modified: message.last_modified,
            role: message.role.as_str().to_string(),
            document: truncate_chars(&message.document, MAX_TEXT_CHARS, TEXT_TRUNCATED_MARKER),
            reasoning_content: truncate_chars(&message.reasoning_content, MAX_TEXT_CHARS, TEXT_TRUNCATED_MARKER),
            thinking_duration: message.thinking_duration,
            is_thinking_fold: message.is_thinking_fold,
        }
    }

    pub fn into_entity(self, id: i64, cloud_id: &str, conversation_id: i64) -> Message {
        Message {
            id,
            cloud_id: cloud_id.to_string(),
            conversation_id,
            creation: self.creation,
            last_modified: self.last_modified,
            role: MessageRole::from_str_lossy(&self.role),
            document: self.document,
            reasoning_content: self.reasoning_content,
            thinking_duration: self.thinking_duration,
            is_thinking_fold: self.is_thinking_fold,
        }
    }
}

impl AttachmentPayload {
    pub fn from_entity(attachment: &Attachment, message_cloud_id: &str) -> Self {
        Self {
            message_cloud_id: message_cloud_id.to_string(),
            last_modified: attachment.last_modified,
            data: cap_binary(&attachment.data),
            preview_image_data: cap_binary(&attachment.preview_image_data),
            image_representation: cap_binary(&attachment.image_representation),
            represented_document: truncate_chars(
                &attachment.represented_document,
                MAX_REPRESENTED_DOCUMENT_CHARS,
                DOCUMENT_TRUNCATED_MARKER,
            ),
            attachment_type: attachment.attachment_type.clone(),
            name: attachment.name.clone(),
            storage_suffix: attachment.storage_suffix.clone(),
            object_identifier: attachment.object_identifier.clone(),
        }
    }

    /// 只保留元数据的版本
    pub fn minimal(&self) -> Self {
        Self {
            message_cloud_id: self.message_cloud_id.clone(),
            last_modified: self.last_modified,
            data: Vec::new(),
            preview_image_data: Vec::new(),
            image_representation: Vec::new(),
            represented_document: ATTACHMENT_TOO_LARGE.to_string(),
            attachment_type: self.attachment_type.clone(),
            name: self.name.clone(),
            storage_suffix: self.storage_suffix.clone(),
            object_identifier: self.object_identifier.clone(),
        }
    }

    pub fn into_entity(self, id: i64, cloud_id: &str, message_id: i64) -> Attachment {
        Attachment {
            id,
            cloud_id: cloud_id.to_string(),
            message_id,
            last_modified: self.last_modified,
            data: self.data,
            preview_image_data: self.preview_image_data,
            image_representation: self.image_representation,
            represented_document: self.represented_document,
            attachment_type: self.attachment_type,
            name: self.name,
            storage_suffix: self.storage_suffix,
            object_identifier: self.object_identifier,
        }
    }
}

impl ModelConfigPayload {
    pub fn from_entity(model: &ModelConfig) -> Self {
        Self {
            model_identifier: model.model_identifier.clone(),
            model_list_endpoint: model.model_list_endpoint.clone(),
            creation: model.creation,
            last_modified: model.last_modified,
            endpoint: model.endpoint.clone(),
            token: model.token.clone(),
            headers: model.headers.clone(),
            capabilities: model.capabilities.clone(),
            context_length: model.context_length,
            comment: model.comment.clone(),
        }
    }

    pub fn into_entity(self, cloud_id: &str) -> ModelConfig {
        ModelConfig {
            cloud_id: cloud_id.to_string(),
            model_identifier: self.model_identifier,
            model_list_endpoint: self.model_list_endpoint,
            creation: self.creation,
            last_modified: self.last_modified,
            endpoint: self.endpoint,
            token: self.token,
            headers: self.headers,
            capabilities: self.capabilities,
            context_length: self.context_length,
            comment: self.comment,
        }
    }
}

// ============================================================
// 体积保护
// ============================================================

/// 超过 `max` 个字符时截断并追加标记
pub fn truncate_chars(text: &str, max: usize, marker: &str) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => {
            let mut truncated = String::with_capacity(cut + marker.len());
            truncated.push_str(&text[..cut]);
            truncated.push_str(marker);
            truncated
        }
        None => text.to_string(),
    }
}

fn cap_binary(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() > MAX_ATTACHMENT_BINARY_BYTES {
        debug!("附件二进制字段 {} bytes 超限，置空", bytes.len());
        Vec::new()
    } else {
        bytes.to_vec()
    }
}

/// 图标超限时尝试 JPEG 重压，失败则返回默认图标
pub fn compress_icon(icon: &[u8]) -> Vec<u8> {
    if icon.len() <= MAX_ICON_BYTES {
        return icon.to_vec();
    }

    let decoded = match image::load_from_memory(icon) {
        Ok(img) => DynamicImage::ImageRgb8(img.to_rgb8()),
        Err(e) => {
            warn!("⚠️ 图标无法解码 ({} bytes): {}，使用默认图标", icon.len(), e);
            return default_icon();
        }
    };

    for quality in (1..=7u8).rev().map(|q| q * 10) {
        let mut buf = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        if let Err(e) = decoded.write_with_encoder(encoder) {
            warn!("图标 JPEG 编码失败 (quality={}): {}", quality, e);
            break;
        }
        if buf.len() <= MAX_ICON_BYTES {
            debug!("图标已压缩: {} → {} bytes (quality={})", icon.len(), buf.len(), quality);
            return buf;
        }
    }

    warn!("⚠️ 图标压缩后仍超过上限，使用默认图标");
    default_icon()
}

/// 40x40 蓝色 PNG
pub fn default_icon() -> Vec<u8> {
    static DEFAULT_ICON: OnceLock<Vec<u8>> = OnceLock::new();
    DEFAULT_ICON
        .get_or_init(|| {
            let img = RgbaImage::from_pixel(40, 40, Rgba([0, 122, 255, 255]));
            let mut buf = Vec::new();
            match DynamicImage::ImageRgba8(img).write_to(&mut Cursor::new(&mut buf), ImageFormat::Png) {
                Ok(()) => buf,
                Err(e) => {
                    warn!("生成默认图标失败: {}", e);
                    Vec::new()
                }
            }
        })
        .clone()
}
