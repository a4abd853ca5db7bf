//! 多设备端到端场景
//!
//! 两个 TestHarness 共享同一个 InMemoryRemoteStore 即模拟两台设备。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};

use super::context::test_support::TestHarness;
use super::coordinator::{CycleOutcome, SyncCoordinator};
use super::entity_sync::payload::{AttachmentPayload, ConversationPayload, MessagePayload, SyncPayload};
use super::entity_sync::SyncableKind;
use super::record::{RemoteRecord, SyncRecord};
use super::remote::memory::RemoteOp;
use super::remote::{InMemoryRemoteStore, RemoteError};
use super::retry::SyncOperation;
use crate::events::{EventFilter, SyncEvent};
use crate::storage::entities::{Attachment, Conversation, LocalChangeType, Message, MessageRole, SyncEntity};
use crate::storage::local_store::LocalStore;

async fn device(device_id: &str, remote: &InMemoryRemoteStore) -> (TestHarness, Arc<SyncCoordinator>) {
    let h = TestHarness::with_remote(device_id, remote.clone()).await;
    let coordinator = SyncCoordinator::new(h.ctx.clone());
    (h, coordinator)
}

fn conversation_record(cloud_id: &str, title: &str, version: DateTime<Utc>, origin: &str) -> RemoteRecord {
    let mut conv = Conversation::new(title, version);
    conv.cloud_id = cloud_id.to_string();
    let payload = SyncPayload::Conversation(ConversationPayload::from_entity(&conv))
        .encode_checked(cloud_id)
        .unwrap();
    RemoteRecord::new(SyncRecord::live(cloud_id, SyncableKind::Conversation, version, origin, payload))
}

fn message_record(cloud_id: &str, conversation_cloud_id: &str, version: DateTime<Utc>) -> RemoteRecord {
    let mut message = Message::new(0, MessageRole::User, "hi", version);
    message.cloud_id = cloud_id.to_string();
    let payload = SyncPayload::Message(MessagePayload::from_entity(&message, conversation_cloud_id))
        .encode_checked(cloud_id)
        .unwrap();
    RemoteRecord::new(SyncRecord::live(cloud_id, SyncableKind::Message, version, "BBB", payload))
}

fn attachment_record(cloud_id: &str, message_cloud_id: &str, version: DateTime<Utc>) -> RemoteRecord {
    let mut attachment = Attachment::new(0, "note.txt", version);
    attachment.cloud_id = cloud_id.to_string();
    let payload = SyncPayload::Attachment(AttachmentPayload::from_entity(&attachment, message_cloud_id))
        .encode_checked(cloud_id)
        .unwrap();
    RemoteRecord::new(SyncRecord::live(cloud_id, SyncableKind::Attachment, version, "BBB", payload))
}

fn title_of(entity: Option<SyncEntity>) -> String {
    match entity {
        Some(SyncEntity::Conversation(conv)) => conv.title,
        other => panic!("expected conversation, got {:?}", other),
    }
}

// ============================================================
// 场景 A：父子实体同一周期上传
// ============================================================

#[tokio::test]
async fn test_parent_and_child_created_offline_sync_in_one_cycle() {
    let remote = InMemoryRemoteStore::new();
    let (a, sync_a) = device("AAA", &remote).await;

    let conv = a.local.upsert(Conversation::new("C1", a.ctx.now()).into()).await.unwrap();
    let conv = sync_a.enqueue_local_change(&conv, LocalChangeType::Create).await.unwrap();
    let message = Message::new(conv.local_id().unwrap(), MessageRole::User, "M1", a.ctx.now());
    let message = a.local.upsert(message.into()).await.unwrap();
    let message = sync_a.enqueue_local_change(&message, LocalChangeType::Create).await.unwrap();

    assert!(sync_a.perform_full_sync().await.is_completed());
    assert_eq!(a.ctx.pending.count().await.unwrap(), 0);

    // 会话所在批次不晚于消息所在批次
    let batches = remote.save_batches();
    let batch_of = |cloud_id: &str| {
        batches
            .iter()
            .position(|batch| batch.iter().any(|r| r.cloud_id == cloud_id))
            .unwrap()
    };
    assert!(batch_of(conv.cloud_id()) <= batch_of(message.cloud_id()));

    // 另一台设备拿到后父子关系正确
    let (b, sync_b) = device("BBB", &remote).await;
    assert!(sync_b.perform_full_sync().await.is_completed());
    let b_conv = b
        .local
        .find_by_cloud_id(SyncableKind::Conversation, conv.cloud_id())
        .await
        .unwrap()
        .unwrap();
    match b.local.find_by_cloud_id(SyncableKind::Message, message.cloud_id()).await.unwrap() {
        Some(SyncEntity::Message(m)) => assert_eq!(Some(m.conversation_id), b_conv.local_id()),
        other => panic!("message missing on BBB: {:?}", other),
    }
}

// ============================================================
// 场景 B：两台设备 1 秒内修改同一会话
// ============================================================

#[tokio::test]
async fn test_concurrent_edits_converge_on_smaller_device_id() {
    let (a, sync_a) = device("AAA", &InMemoryRemoteStore::new()).await;
    let (b, sync_b) = device("BBB", &InMemoryRemoteStore::new()).await;
    let t = a.ctx.now();
    let t_b = t + chrono::Duration::milliseconds(500);

    let mut local_a = Conversation::new("title from AAA", t);
    local_a.cloud_id = "c1".to_string();
    a.local.upsert(local_a.into()).await.unwrap();
    let mut local_b = Conversation::new("title from BBB", t_b);
    local_b.cloud_id = "c1".to_string();
    b.local.upsert(local_b.into()).await.unwrap();

    // 各自收到对方的版本
    a.remote.insert_raw(&a.ctx.zone, conversation_record("c1", "title from BBB", t_b, "BBB"));
    b.remote.insert_raw(&b.ctx.zone, conversation_record("c1", "title from AAA", t, "AAA"));

    assert!(sync_a.perform_full_sync().await.is_completed());
    assert!(sync_b.perform_full_sync().await.is_completed());

    let on_a = title_of(a.local.find_by_cloud_id(SyncableKind::Conversation, "c1").await.unwrap());
    let on_b = title_of(b.local.find_by_cloud_id(SyncableKind::Conversation, "c1").await.unwrap());
    assert_eq!(on_a, "title from AAA");
    assert_eq!(on_b, "title from AAA");
}

#[tokio::test]
async fn test_older_remote_within_five_minutes_still_wins() {
    let (a, sync_a) = device("AAA", &InMemoryRemoteStore::new()).await;
    let t = a.ctx.now();

    let mut local = Conversation::new("newer local", t);
    local.cloud_id = "c1".to_string();
    a.local.upsert(local.into()).await.unwrap();
    a.remote.insert_raw(
        &a.ctx.zone,
        conversation_record("c1", "older remote", t - chrono::Duration::seconds(60), "BBB"),
    );

    sync_a.perform_full_sync().await;
    let title = title_of(a.local.find_by_cloud_id(SyncableKind::Conversation, "c1").await.unwrap());
    assert_eq!(title, "older remote");
}

// ============================================================
// 场景 C：压缩
// ============================================================

fn historical(h: &TestHarness, index: usize, removed: bool) -> RemoteRecord {
    let version = h.ctx.now() - chrono::Duration::days(40 + 5 - index as i64);
    let record = if removed {
        SyncRecord::tombstone("c-old", SyncableKind::Conversation, version, "BBB")
    } else {
        SyncRecord::live("c-old", SyncableKind::Conversation, version, "BBB", vec![index as u8])
    };
    RemoteRecord {
        record_id: format!("c-old-v{}", index),
        record,
    }
}

#[tokio::test]
async fn test_compaction_removes_whole_group_when_newest_is_tombstone() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    let zone = h.ctx.zone.clone();
    h.remote.create_zone_sync(&zone);
    for index in 0..5 {
        h.remote.insert_raw(&zone, historical(&h, index, index == 4));
    }

    let report = sync.perform_compaction().await.unwrap();
    assert_eq!(report.groups, 1);
    assert_eq!(report.deleted, 5);
    assert!(h.remote.records(&zone).is_empty());
}

#[tokio::test]
async fn test_compaction_keeps_newest_live_version() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    let zone = h.ctx.zone.clone();
    h.remote.create_zone_sync(&zone);
    for index in 0..5 {
        h.remote.insert_raw(&zone, historical(&h, index, false));
    }

    let report = sync.perform_compaction().await.unwrap();
    assert_eq!(report.deleted, 4);
    let left = h.remote.records(&zone);
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].record_id, "c-old-v4");
}

// ============================================================
// 并发与回声
// ============================================================

#[tokio::test]
async fn test_concurrent_triggers_run_once() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    h.remote.set_latency(Some(Duration::from_millis(20)));

    let outcomes = join_all((0..5).map(|_| sync.perform_full_sync())).await;
    assert_eq!(outcomes.iter().filter(|o| o.is_completed()).count(), 1);
    assert_eq!(
        outcomes.iter().filter(|o| **o == CycleOutcome::AlreadyRunning).count(),
        4
    );
    assert_eq!(h.remote.call_count(RemoteOp::ListSubscriptions), 1);
}

#[tokio::test]
async fn test_own_upload_is_not_reapplied() {
    let remote = InMemoryRemoteStore::new();
    let (a, sync_a) = device("AAA", &remote).await;
    assert!(sync_a.perform_full_sync().await.is_completed());

    let conv = a.local.upsert(Conversation::new("mine", a.ctx.now()).into()).await.unwrap();
    sync_a.enqueue_local_change(&conv, LocalChangeType::Create).await.unwrap();
    let upload = sync_a.push_pending_changes().await.unwrap();
    assert_eq!(upload.uploaded, 1);

    let download = sync_a.sync_remote_changes().await.unwrap();
    assert_eq!(download.skipped_echo, 1);
    assert_eq!(download.applied, 0);
    assert_eq!(a.local.count(SyncableKind::Conversation).await.unwrap(), 1);

    // 另一台设备正常应用
    let (b, sync_b) = device("BBB", &remote).await;
    assert!(sync_b.perform_full_sync().await.is_completed());
    assert_eq!(b.local.count(SyncableKind::Conversation).await.unwrap(), 1);
}

// ============================================================
// 依赖顺序
// ============================================================

#[tokio::test]
async fn test_child_enqueued_before_parent_syncs_eventually() {
    let remote = InMemoryRemoteStore::new();
    let (a, sync_a) = device("AAA", &remote).await;

    // 会话只写本地，没有入队
    let conv = a.local.upsert(Conversation::new("parent", a.ctx.now()).into()).await.unwrap();
    let message = Message::new(conv.local_id().unwrap(), MessageRole::User, "child", a.ctx.now());
    let message = a.local.upsert(message.into()).await.unwrap();
    sync_a.enqueue_local_change(&message, LocalChangeType::Create).await.unwrap();

    sync_a.perform_full_sync().await;
    sync_a.perform_full_sync().await;
    assert_eq!(a.ctx.pending.count().await.unwrap(), 0);
    assert_eq!(remote.records(&a.ctx.zone).len(), 2);

    let (b, sync_b) = device("BBB", &remote).await;
    sync_b.perform_full_sync().await;
    assert_eq!(b.local.count(SyncableKind::Message).await.unwrap(), 1);
    assert_eq!(b.ctx.deferred_store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_three_level_chain_resolves_once_root_arrives() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    let zone = h.ctx.zone.clone();
    let now = h.ctx.now();
    h.remote.create_zone_sync(&zone);
    h.remote.insert_raw(&zone, message_record("m1", "c1", now));
    h.remote.insert_raw(&zone, attachment_record("a1", "m1", now));

    sync.perform_full_sync().await;
    assert_eq!(h.ctx.deferred_store.count().await.unwrap(), 2);

    h.remote.insert_raw(&zone, conversation_record("c1", "root", now, "BBB"));
    let outcome = sync.perform_full_sync().await;
    assert!(outcome.is_completed());
    assert_eq!(h.ctx.deferred_store.count().await.unwrap(), 0);
    assert_eq!(h.local.count(SyncableKind::Attachment).await.unwrap(), 1);
    assert_eq!(outcome.report().unwrap().deferred_applied, 2);
}

// ============================================================
// 上限
// ============================================================

#[tokio::test]
async fn test_retry_gives_up_after_five_attempts() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    let mut events = h.ctx.events.subscribe_filtered(
        EventFilter::new().with_event_types(vec!["retry_scheduled".to_string(), "retry_abandoned".to_string()]),
    );

    for _ in 0..6 {
        h.remote.fail_next(RemoteOp::FetchDatabaseChanges, RemoteError::NetworkFailure);
        assert_err!(sync.sync_remote_changes().await);
    }

    let mut scheduled = 0;
    let mut abandoned = 0;
    for _ in 0..6 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SyncEvent::RetryScheduled { operation, .. } => {
                assert_eq!(operation, "download");
                scheduled += 1;
            }
            SyncEvent::RetryAbandoned { operation, .. } => {
                assert_eq!(operation, "download");
                abandoned += 1;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(scheduled, 5);
    assert_eq!(abandoned, 1);
    assert_eq!(sync.retry_attempts(SyncOperation::Download), 0);
    sync.shutdown();
}

#[tokio::test]
async fn test_orphan_is_discarded_after_ten_passes() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    let zone = h.ctx.zone.clone();
    h.remote.create_zone_sync(&zone);
    h.remote.insert_raw(&zone, message_record("m-orphan", "c-never", h.ctx.now()));

    // 每次只跑一轮延迟队列
    for _ in 0..9 {
        assert_ok!(sync.sync_remote_changes().await);
    }
    assert_eq!(h.ctx.deferred_store.count().await.unwrap(), 1);

    assert_ok!(sync.sync_remote_changes().await);
    assert_eq!(h.ctx.deferred_store.count().await.unwrap(), 0);
}

// ============================================================
// 幂等与 zone 重置
// ============================================================

#[tokio::test]
async fn test_redelivered_record_leaves_state_unchanged() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    let zone = h.ctx.zone.clone();
    let record = conversation_record("c1", "same", h.ctx.now(), "BBB");
    h.remote.insert_raw(&zone, record.clone());
    sync.perform_full_sync().await;
    let first = h.local.find_by_cloud_id(SyncableKind::Conversation, "c1").await.unwrap();

    h.remote.insert_raw(&zone, record);
    sync.perform_full_sync().await;
    let second = h.local.find_by_cloud_id(SyncableKind::Conversation, "c1").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(h.local.count(SyncableKind::Conversation).await.unwrap(), 1);
}

#[tokio::test]
async fn test_deleted_zone_triggers_setup_again() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    assert!(sync.perform_full_sync().await.is_completed());
    let conv = h.local.upsert(Conversation::new("c", h.ctx.now()).into()).await.unwrap();
    sync.enqueue_local_change(&conv, LocalChangeType::Create).await.unwrap();
    assert_ok!(sync.push_pending_changes().await);

    h.remote.delete_zone(&h.ctx.zone);
    let mut events = h
        .ctx
        .events
        .subscribe_filtered(EventFilter::new().with_event_types(vec!["zone_reset".to_string()]));

    let outcome = sync.perform_full_sync().await;
    assert!(outcome.report().unwrap().setup_ran);
    assert!(h.ctx.is_setup_complete().await.unwrap());
    assert!(h.remote.zone_exists(&h.ctx.zone));
    assert!(matches!(events.try_recv(), Ok(SyncEvent::ZoneReset { .. })));
}

#[tokio::test]
async fn test_refresh_prefers_incremental_when_recent() {
    let (h, sync) = device("AAA", &InMemoryRemoteStore::new()).await;
    assert!(sync.refresh().await.is_completed());
    let zone_calls = h.remote.call_count(RemoteOp::CreateZone);

    // 刚同步过：增量刷新不再确保 zone
    assert!(sync.refresh().await.is_completed());
    assert_eq!(h.remote.call_count(RemoteOp::CreateZone), zone_calls);

    h.clock.advance(chrono::Duration::seconds(301));
    assert!(sync.refresh().await.is_completed());
    assert_eq!(h.remote.call_count(RemoteOp::CreateZone), zone_calls + 1);
}
