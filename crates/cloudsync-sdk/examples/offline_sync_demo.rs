//! 两台"设备"共享一个内存远端，演示离线写入后的同步
//!
//! 运行: cargo run --example offline_sync_demo

use std::sync::Arc;

use cloudsync_sdk::utils::logging::init_logging;
use cloudsync_sdk::{
    CloudSyncConfig, CloudSyncSDK, Conversation, InMemoryRemoteStore, LocalChangeType, LocalStore, Message, MessageRole,
    SyncableKind,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(false);

    let remote = Arc::new(InMemoryRemoteStore::new());
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;

    let config = |dir: &std::path::Path, device: &str| {
        CloudSyncConfig::builder()
            .data_dir(dir)
            .device_id(device)
            .build()
    };
    let device_a = CloudSyncSDK::initialize(config(dir_a.path(), "AAA"), remote.clone()).await?;
    let device_b = CloudSyncSDK::initialize(config(dir_b.path(), "BBB"), remote.clone()).await?;

    // 设备 A 离线创建会话与消息
    let conversation = device_a
        .local_store()
        .upsert(Conversation::new("Trip planning", chrono::Utc::now()).into())
        .await?;
    let conversation = device_a
        .record_local_change(&conversation, LocalChangeType::Create)
        .await?;
    let message = Message::new(
        conversation.local_id().unwrap_or_default(),
        MessageRole::User,
        "Where should we go?",
        chrono::Utc::now(),
    );
    let message = device_a.local_store().upsert(message.into()).await?;
    device_a.record_local_change(&message, LocalChangeType::Create).await?;

    println!("A: {:?}", device_a.sync_now().await);
    println!("B: {:?}", device_b.sync_now().await);

    let conversations = device_b.local_store().count(SyncableKind::Conversation).await?;
    let messages = device_b.local_store().count(SyncableKind::Message).await?;
    println!("设备 B 现有会话 {} 个，消息 {} 条", conversations, messages);

    device_a.shutdown().await?;
    device_b.shutdown().await?;
    Ok(())
}
