//! 实体同步 - 类型枚举、游标、payload 与分发表
//!
//! 与上层编排正交：这里只负责"一条记录如何编码 / 如何落到本地"，
//! 批次、重试、状态都由 `sync` 下的组件负责。

mod entity_type;
mod cursor_store;
pub mod payload;
pub mod handlers;
mod applier;

pub use entity_type::SyncableKind;
pub use cursor_store::{ChangeTokenStore, TokenScope};
pub use payload::SyncPayload;
pub use handlers::{handler_for, KindHandler};
pub use applier::{ApplyOutcome, EchoFilter, RecordApplier};
