//! SQLite 本地存储 - 四类可同步实体的持久化
//!
//! 表结构由 `migrations/` 管理；打开时统一走 `migrate::init_db`。
//! 级联删除依赖 `PRAGMA foreign_keys=ON`。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::error::{CloudSyncError, Result};
use crate::storage::entities::{Attachment, Conversation, Message, MessageRole, ModelConfig, SyncEntity};
use crate::storage::local_store::LocalStore;
use crate::storage::migrate;
use crate::sync::entity_sync::SyncableKind;
use crate::utils::time::from_millis;

const CONVERSATION_COLUMNS: &str =
    "id, cloud_id, title, creation, last_modified, icon, is_favorite, should_auto_rename, model_id";
const MESSAGE_COLUMNS: &str = "id, cloud_id, conversation_id, creation, last_modified, role, document, \
     reasoning_content, thinking_duration, is_thinking_fold";
const ATTACHMENT_COLUMNS: &str = "id, cloud_id, message_id, last_modified, data, preview_image_data, \
     image_representation, represented_document, attachment_type, name, storage_suffix, object_identifier";
const MODEL_COLUMNS: &str = "cloud_id, model_identifier, model_list_endpoint, creation, last_modified, \
     endpoint, token, headers, capabilities, context_length, comment";

/// SQLite 实现的 LocalStore
#[derive(Debug)]
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
}

impl SqliteLocalStore {
    /// 打开（或创建）数据库文件并执行迁移
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CloudSyncError::IO(format!("创建数据库目录失败: {}", e)))?;
        }
        let mut conn = Connection::open(db_path)
            .map_err(|e| CloudSyncError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        tracing::info!("✅ 本地数据库已就绪: {}", db_path.display());
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| CloudSyncError::Database(format!("打开内存数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

// ============================================================
// 行映射
// ============================================================

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        cloud_id: row.get(1)?,
        title: row.get(2)?,
        creation: from_millis(row.get(3)?),
        last_modified: from_millis(row.get(4)?),
        icon: row.get(5)?,
        is_favorite: row.get(6)?,
        should_auto_rename: row.get(7)?,
        model_id: row.get(8)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        cloud_id: row.get(1)?,
        conversation_id: row.get(2)?,
        creation: from_millis(row.get(3)?),
        last_modified: from_millis(row.get(4)?),
        role: MessageRole::from_str_lossy(&role),
        document: row.get(6)?,
        reasoning_content: row.get(7)?,
        thinking_duration: row.get(8)?,
        is_thinking_fold: row.get(9)?,
    })
}

fn attachment_from_row(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get(0)?,
        cloud_id: row.get(1)?,
        message_id: row.get(2)?,
        last_modified: from_millis(row.get(3)?),
        data: row.get(4)?,
        preview_image_data: row.get(5)?,
        image_representation: row.get(6)?,
        represented_document: row.get(7)?,
        attachment_type: row.get(8)?,
        name: row.get(9)?,
        storage_suffix: row.get(10)?,
        object_identifier: row.get(11)?,
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelConfig> {
    let headers: String = row.get(7)?;
    let capabilities: String = row.get(8)?;
    Ok(ModelConfig {
        cloud_id: row.get(0)?,
        model_identifier: row.get(1)?,
        model_list_endpoint: row.get(2)?,
        creation: from_millis(row.get(3)?),
        last_modified: from_millis(row.get(4)?),
        endpoint: row.get(5)?,
        token: row.get(6)?,
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        capabilities: serde_json::from_str(&capabilities).unwrap_or_default(),
        context_length: row.get(9)?,
        comment: row.get(10)?,
    })
}

fn table_of(kind: SyncableKind) -> (&'static str, &'static str) {
    match kind {
        SyncableKind::Conversation => ("conversation", CONVERSATION_COLUMNS),
        SyncableKind::Message => ("message", MESSAGE_COLUMNS),
        SyncableKind::Attachment => ("attachment", ATTACHMENT_COLUMNS),
        SyncableKind::ModelConfig => ("model_config", MODEL_COLUMNS),
    }
}

fn entity_from_row(kind: SyncableKind, row: &Row<'_>) -> rusqlite::Result<SyncEntity> {
    Ok(match kind {
        SyncableKind::Conversation => SyncEntity::Conversation(conversation_from_row(row)?),
        SyncableKind::Message => SyncEntity::Message(message_from_row(row)?),
        SyncableKind::Attachment => SyncEntity::Attachment(attachment_from_row(row)?),
        SyncableKind::ModelConfig => SyncEntity::ModelConfig(model_from_row(row)?),
    })
}

fn query_entities(
    conn: &Connection,
    kind: SyncableKind,
    where_clause: &str,
    param: Option<&dyn rusqlite::ToSql>,
) -> Result<Vec<SyncEntity>> {
    let (table, columns) = table_of(kind);
    let sql = format!("SELECT {} FROM {} {}", columns, table, where_clause);
    let params: Vec<&dyn rusqlite::ToSql> = param.into_iter().collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| entity_from_row(kind, row))?;
    let mut entities = Vec::new();
    for row in rows {
        entities.push(row?);
    }
    Ok(entities)
}

/// 按 cloud_id 找本地主键；cloud_id 为空时不匹配
fn local_id_by_cloud_id(conn: &Connection, table: &str, cloud_id: &str) -> Result<Option<i64>> {
    if cloud_id.is_empty() {
        return Ok(None);
    }
    let id = conn
        .query_row(
            &format!("SELECT id FROM {} WHERE cloud_id = ?1", table),
            [cloud_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

// ============================================================
// 写入
// ============================================================

fn upsert_conversation(conn: &Connection, mut c: Conversation) -> Result<Conversation> {
    if c.id == 0 {
        c.id = local_id_by_cloud_id(conn, "conversation", &c.cloud_id)?.unwrap_or(0);
    }
    if c.id == 0 {
        conn.execute(
            "INSERT INTO conversation (cloud_id, title, creation, last_modified, icon, is_favorite, should_auto_rename, model_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                c.cloud_id,
                c.title,
                c.creation.timestamp_millis(),
                c.last_modified.timestamp_millis(),
                c.icon,
                c.is_favorite,
                c.should_auto_rename,
                c.model_id
            ],
        )?;
        c.id = conn.last_insert_rowid();
    } else {
        conn.execute(
            "UPDATE conversation SET cloud_id = ?2, title = ?3, creation = ?4, last_modified = ?5, icon = ?6,
                 is_favorite = ?7, should_auto_rename = ?8, model_id = ?9
             WHERE id = ?1",
            params![
                c.id,
                c.cloud_id,
                c.title,
                c.creation.timestamp_millis(),
                c.last_modified.timestamp_millis(),
                c.icon,
                c.is_favorite,
                c.should_auto_rename,
                c.model_id
            ],
        )?;
    }
    Ok(c)
}

fn upsert_message(conn: &Connection, mut m: Message) -> Result<Message> {
    if m.id == 0 {
        m.id = local_id_by_cloud_id(conn, "message", &m.cloud_id)?.unwrap_or(0);
    }
    if m.id == 0 {
        conn.execute(
            "INSERT INTO message (cloud_id, conversation_id, creation, last_modified, role, document,
                 reasoning_content, thinking_duration, is_thinking_fold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                m.cloud_id,
                m.conversation_id,
                m.creation.timestamp_millis(),
                m.last_modified.timestamp_millis(),
                m.role.as_str(),
                m.document,
                m.reasoning_content,
                m.thinking_duration,
                m.is_thinking_fold
            ],
        )?;
        m.id = conn.last_insert_rowid();
    } else {
        conn.execute(
            "UPDATE message SET cloud_id = ?2, conversation_id = ?3, creation = ?4, last_modified = ?5, role = ?6,
                 document = ?7, reasoning_content = ?8, thinking_duration = ?9, is_thinking_fold = ?10
             WHERE id = ?1",
            params![
                m.id,
                m.cloud_id,
                m.conversation_id,
                m.creation.timestamp_millis(),
                m.last_modified.timestamp_millis(),
                m.role.as_str(),
                m.document,
                m.reasoning_content,
                m.thinking_duration,
                m.is_thinking_fold
            ],
        )?;
    }
    Ok(m)
}

fn upsert_attachment(conn: &Connection, mut a: Attachment) -> Result<Attachment> {
    if a.id == 0 {
        a.id = local_id_by_cloud_id(conn, "attachment", &a.cloud_id)?.unwrap_or(0);
    }
    if a.id == 0 {
        conn.execute(
            "INSERT INTO attachment (cloud_id, message_id, last_modified, data, preview_image_data, image_representation,
                 represented_document, attachment_type, name, storage_suffix, object_identifier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                a.cloud_id,
                a.message_id,
                a.last_modified.timestamp_millis(),
                a.data,
                a.preview_image_data,
                a.image_representation,
                a.represented_document,
                a.attachment_type,
                a.name,
                a.storage_suffix,
                a.object_identifier
            ],
        )?;
        a.id = conn.last_insert_rowid();
    } else {
        conn.execute(
            "UPDATE attachment SET cloud_id = ?2, message_id = ?3, last_modified = ?4, data = ?5, preview_image_data = ?6,
                 image_representation = ?7, represented_document = ?8, attachment_type = ?9, name = ?10,
                 storage_suffix = ?11, object_identifier = ?12
             WHERE id = ?1",
            params![
                a.id,
                a.cloud_id,
                a.message_id,
                a.last_modified.timestamp_millis(),
                a.data,
                a.preview_image_data,
                a.image_representation,
                a.represented_document,
                a.attachment_type,
                a.name,
                a.storage_suffix,
                a.object_identifier
            ],
        )?;
    }
    Ok(a)
}

fn upsert_model(conn: &Connection, m: ModelConfig) -> Result<ModelConfig> {
    if m.cloud_id.is_empty() {
        return Err(CloudSyncError::InvalidData("模型配置缺少 cloud_id".to_string()));
    }
    let headers = serde_json::to_string(&m.headers)?;
    let capabilities = serde_json::to_string(&m.capabilities)?;
    conn.execute(
        "INSERT INTO model_config (cloud_id, model_identifier, model_list_endpoint, creation, last_modified,
             endpoint, token, headers, capabilities, context_length, comment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(cloud_id) DO UPDATE SET
             model_identifier = excluded.model_identifier,
             model_list_endpoint = excluded.model_list_endpoint,
             creation = excluded.creation,
             last_modified = excluded.last_modified,
             endpoint = excluded.endpoint,
             token = excluded.token,
             headers = excluded.headers,
             capabilities = excluded.capabilities,
             context_length = excluded.context_length,
             comment = excluded.comment",
        params![
            m.cloud_id,
            m.model_identifier,
            m.model_list_endpoint,
            m.creation.timestamp_millis(),
            m.last_modified.timestamp_millis(),
            m.endpoint,
            m.token,
            headers,
            capabilities,
            m.context_length,
            m.comment
        ],
    )?;
    Ok(m)
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn find_by_cloud_id(&self, kind: SyncableKind, cloud_id: &str) -> Result<Option<SyncEntity>> {
        if cloud_id.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().await;
        let mut found = query_entities(&conn, kind, "WHERE cloud_id = ?1", Some(&cloud_id))?;
        Ok(found.pop())
    }

    async fn find_by_local_id(&self, kind: SyncableKind, local_id: i64) -> Result<Option<SyncEntity>> {
        if kind == SyncableKind::ModelConfig {
            return Ok(None);
        }
        let conn = self.conn.lock().await;
        let mut found = query_entities(&conn, kind, "WHERE id = ?1", Some(&local_id))?;
        Ok(found.pop())
    }

    async fn upsert(&self, entity: SyncEntity) -> Result<SyncEntity> {
        let conn = self.conn.lock().await;
        let saved = match entity {
            SyncEntity::Conversation(c) => SyncEntity::Conversation(upsert_conversation(&conn, c)?),
            SyncEntity::Message(m) => SyncEntity::Message(upsert_message(&conn, m)?),
            SyncEntity::Attachment(a) => SyncEntity::Attachment(upsert_attachment(&conn, a)?),
            SyncEntity::ModelConfig(m) => SyncEntity::ModelConfig(upsert_model(&conn, m)?),
        };
        Ok(saved)
    }

    async fn remove(&self, kind: SyncableKind, cloud_id: &str) -> Result<bool> {
        if cloud_id.is_empty() {
            return Ok(false);
        }
        let (table, _) = table_of(kind);
        let conn = self.conn.lock().await;
        let changed = conn.execute(&format!("DELETE FROM {} WHERE cloud_id = ?1", table), [cloud_id])?;
        Ok(changed > 0)
    }

    async fn list(&self, kind: SyncableKind) -> Result<Vec<SyncEntity>> {
        let conn = self.conn.lock().await;
        query_entities(&conn, kind, "", None)
    }

    async fn modified_since(&self, kind: SyncableKind, since: DateTime<Utc>) -> Result<Vec<SyncEntity>> {
        let conn = self.conn.lock().await;
        let millis = since.timestamp_millis();
        query_entities(&conn, kind, "WHERE last_modified >= ?1", Some(&millis))
    }

    async fn count(&self, kind: SyncableKind) -> Result<usize> {
        let (table, _) = table_of(kind);
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
