//! 事件系统模块 - 同步引擎对 UI 层的通知通道
//!
//! 功能包括：
//! - 同步状态变更
//! - 本地数据变更（UI 刷新）
//! - 上传丢弃、重试调度 / 放弃
//! - zone 重置、首次初始化完成、压缩完成
//!
//! 事件通过 broadcast 通道分发，另外支持按事件类型注册回调。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::sync::entity_sync::SyncableKind;
use crate::sync::SyncStatus;

/// 本地数据变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOperation {
    Upserted,
    Removed,
}

/// 同步事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 同步状态变更
    StatusChanged { status: SyncStatus, timestamp: i64 },
    /// 远端变更已写入本地
    DataChanged {
        kind: SyncableKind,
        operation: DataOperation,
        cloud_id: String,
        timestamp: i64,
    },
    /// 一轮下载处理完成（至少应用了一条记录）
    DataProcessed { count: usize, timestamp: i64 },
    SyncCompleted { uploaded: usize, downloaded: usize, timestamp: i64 },
    SyncFailed { error: String, timestamp: i64 },
    /// 上传条目被永久丢弃
    UploadDropped {
        kind: SyncableKind,
        cloud_id: String,
        reason: String,
        timestamp: i64,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: i64,
    },
    RetryAbandoned { operation: String, timestamp: i64 },
    /// 远端 zone 被删除，游标已重置
    ZoneReset { zone: String, timestamp: i64 },
    SetupCompleted { timestamp: i64 },
    CompactionFinished { deleted: usize, timestamp: i64 },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::DataChanged { .. } => "data_changed",
            SyncEvent::DataProcessed { .. } => "data_processed",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::UploadDropped { .. } => "upload_dropped",
            SyncEvent::RetryScheduled { .. } => "retry_scheduled",
            SyncEvent::RetryAbandoned { .. } => "retry_abandoned",
            SyncEvent::ZoneReset { .. } => "zone_reset",
            SyncEvent::SetupCompleted { .. } => "setup_completed",
            SyncEvent::CompactionFinished { .. } => "compaction_finished",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::StatusChanged { timestamp, .. }
            | SyncEvent::DataChanged { timestamp, .. }
            | SyncEvent::DataProcessed { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::SyncFailed { timestamp, .. }
            | SyncEvent::UploadDropped { timestamp, .. }
            | SyncEvent::RetryScheduled { timestamp, .. }
            | SyncEvent::RetryAbandoned { timestamp, .. }
            | SyncEvent::ZoneReset { timestamp, .. }
            | SyncEvent::SetupCompleted { timestamp }
            | SyncEvent::CompactionFinished { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的实体类型
    pub fn kind(&self) -> Option<SyncableKind> {
        match self {
            SyncEvent::DataChanged { kind, .. } | SyncEvent::UploadDropped { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub kinds: Option<Vec<SyncableKind>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_kinds(mut self, kinds: Vec<SyncableKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ref kinds) = self.kinds {
            match event.kind() {
                Some(kind) if kinds.contains(&kind) => {}
                _ => return false,
            }
        }
        true
    }
}

pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器（NotificationBus）
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 失败属正常情况
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(typed) = listeners.get(event.event_type()) {
            for listener in typed {
                listener(&event);
            }
        }
        if let Some(general) = listeners.get("*") {
            for listener in general {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`"*"` 监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn status_changed(status: SyncStatus) -> SyncEvent {
        SyncEvent::StatusChanged {
            status,
            timestamp: now_millis(),
        }
    }

    pub fn data_changed(kind: SyncableKind, operation: DataOperation, cloud_id: &str) -> SyncEvent {
        SyncEvent::DataChanged {
            kind,
            operation,
            cloud_id: cloud_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn data_processed(count: usize) -> SyncEvent {
        SyncEvent::DataProcessed {
            count,
            timestamp: now_millis(),
        }
    }

    pub fn sync_completed(uploaded: usize, downloaded: usize) -> SyncEvent {
        SyncEvent::SyncCompleted {
            uploaded,
            downloaded,
            timestamp: now_millis(),
        }
    }

    pub fn sync_failed(error: impl Into<String>) -> SyncEvent {
        SyncEvent::SyncFailed {
            error: error.into(),
            timestamp: now_millis(),
        }
    }

    pub fn upload_dropped(kind: SyncableKind, cloud_id: &str, reason: impl Into<String>) -> SyncEvent {
        SyncEvent::UploadDropped {
            kind,
            cloud_id: cloud_id.to_string(),
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }

    pub fn retry_scheduled(operation: &str, attempt: u32, delay_ms: u64) -> SyncEvent {
        SyncEvent::RetryScheduled {
            operation: operation.to_string(),
            attempt,
            delay_ms,
            timestamp: now_millis(),
        }
    }

    pub fn retry_abandoned(operation: &str) -> SyncEvent {
        SyncEvent::RetryAbandoned {
            operation: operation.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn zone_reset(zone: &str) -> SyncEvent {
        SyncEvent::ZoneReset {
            zone: zone.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn setup_completed() -> SyncEvent {
        SyncEvent::SetupCompleted { timestamp: now_millis() }
    }

    pub fn compaction_finished(deleted: usize) -> SyncEvent {
        SyncEvent::CompactionFinished {
            deleted,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_emit_reaches_subscribers_and_listeners() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        manager
            .add_listener("data_processed", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        manager.emit(event_builders::data_processed(3)).await;
        manager.emit(event_builders::setup_completed()).await;

        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::DataProcessed { count: 3, .. }));
        assert!(matches!(rx.recv().await.unwrap(), SyncEvent::SetupCompleted { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.listener_count, 1);
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe_filtered(EventFilter::new().with_kinds(vec![SyncableKind::Message]));

        manager
            .emit(event_builders::data_changed(SyncableKind::Conversation, DataOperation::Upserted, "c1"))
            .await;
        manager
            .emit(event_builders::data_changed(SyncableKind::Message, DataOperation::Removed, "m1"))
            .await;

        match rx.recv().await.unwrap() {
            SyncEvent::DataChanged { cloud_id, operation, .. } => {
                assert_eq!(cloud_id, "m1");
                assert_eq!(operation, DataOperation::Removed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
