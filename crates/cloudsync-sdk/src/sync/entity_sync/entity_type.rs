//! 可同步实体类型 - 受控枚举
//!
//! 线上记录的 `type` 字段只允许这四个值，新增类型需要所有设备同步升级。

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 可同步实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncableKind {
    ModelConfig,
    Conversation,
    Message,
    Attachment,
}

impl SyncableKind {
    /// 上传顺序：父实体总是先于子实体推送
    pub const UPLOAD_ORDER: [SyncableKind; 4] = [
        SyncableKind::ModelConfig,
        SyncableKind::Conversation,
        SyncableKind::Message,
        SyncableKind::Attachment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModelConfig => "model",
            Self::Conversation => "conversation",
            Self::Message => "message",
            Self::Attachment => "attachment",
        }
    }

    /// 父实体类型（message → conversation，attachment → message）
    pub fn parent(self) -> Option<SyncableKind> {
        match self {
            Self::Message => Some(Self::Conversation),
            Self::Attachment => Some(Self::Message),
            Self::ModelConfig | Self::Conversation => None,
        }
    }
}

impl FromStr for SyncableKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::ModelConfig),
            "conversation" => Ok(Self::Conversation),
            "message" => Ok(Self::Message),
            "attachment" => Ok(Self::Attachment),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for SyncableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
