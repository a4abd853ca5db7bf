//! 存储层
//!
//! - `kv`：sled KV，保存游标、队列与小状态
//! - `local_store`：实体 CRUD 抽象，`sqlite` / `memory` 两种实现
//! - `queue`：待上传队列与延迟依赖队列

pub mod entities;
pub mod kv;
pub mod local_store;
pub mod memory;
pub mod migrate;
pub mod queue;
pub mod sqlite;

pub use entities::{Attachment, Conversation, LocalChangeType, Message, MessageRole, ModelConfig, SyncEntity};
pub use kv::KvStore;
pub use local_store::LocalStore;
pub use memory::MemoryLocalStore;
pub use sqlite::SqliteLocalStore;

use serde::{Deserialize, Serialize};

/// KV 存储统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvStats {
    pub key_count: u64,
    /// 磁盘占用（字节）
    pub storage_size: u64,
}
