//! 内存远端存储
//!
//! 行为与真实记录存储保持一致的部分：
//! - 每个 zone 一份按序号递增的变更日志，游标即序号
//! - 数据库级变更日志记录哪些 zone 有变化 / 被删除
//! - 分页拉取、条件查询分页、订阅
//!
//! 另外提供故障注入（整批失败、逐条失败、延迟）供同步引擎测试使用。
//! `Clone` 出来的实例共享同一份数据，可以模拟多台设备访问同一个账号。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChangeToken, DatabaseChanges, QueryCursor, QueryPage, RecordQuery, RemoteError, RemoteResult, RemoteStore,
    SaveResult, Subscription, ZoneChanges, ZoneId,
};
use crate::sync::record::{RemoteRecord, SyncRecord};

/// 远端操作类型（故障注入 / 调用计数用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    CreateZone,
    FetchDatabaseChanges,
    FetchZoneChanges,
    SaveRecords,
    DeleteRecords,
    Query,
    ListSubscriptions,
    Subscribe,
}

#[derive(Debug, Clone)]
struct ZoneChange {
    seq: u64,
    record_id: String,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct DatabaseChange {
    seq: u64,
    zone: ZoneId,
    deleted: bool,
}

#[derive(Debug, Default)]
struct ZoneState {
    records: BTreeMap<String, RemoteRecord>,
    log: Vec<ZoneChange>,
}

#[derive(Debug)]
struct RemoteState {
    zones: BTreeMap<ZoneId, ZoneState>,
    database_log: Vec<DatabaseChange>,
    seq: u64,
    subscriptions: BTreeMap<String, Subscription>,
    page_size: usize,
    latency: Option<Duration>,
    pending_failures: HashMap<RemoteOp, VecDeque<Option<RemoteError>>>,
    record_errors: HashMap<String, RemoteError>,
    save_batches: Vec<Vec<SyncRecord>>,
    calls: HashMap<RemoteOp, usize>,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            zones: BTreeMap::new(),
            database_log: Vec::new(),
            seq: 0,
            subscriptions: BTreeMap::new(),
            page_size: 200,
            latency: None,
            pending_failures: HashMap::new(),
            record_errors: HashMap::new(),
            save_batches: Vec::new(),
            calls: HashMap::new(),
        }
    }
}

impl RemoteState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// 记录调用并弹出一个预置错误（如果有）
    fn enter(&mut self, op: RemoteOp) -> RemoteResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.pending_failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn touch_zone(&mut self, zone: &str, deleted: bool) {
        let seq = self.next_seq();
        self.database_log.push(DatabaseChange {
            seq,
            zone: zone.to_string(),
            deleted,
        });
    }

    fn put_record(&mut self, zone: &str, record: RemoteRecord) {
        let seq = self.next_seq();
        let state = self.zones.entry(zone.to_string()).or_default();
        state.log.push(ZoneChange {
            seq,
            record_id: record.record_id.clone(),
            deleted: false,
        });
        state.records.insert(record.record_id.clone(), record);
    }

    fn delete_record(&mut self, zone: &str, record_id: &str) {
        let seq = self.next_seq();
        if let Some(state) = self.zones.get_mut(zone) {
            state.records.remove(record_id);
            state.log.push(ZoneChange {
                seq,
                record_id: record_id.to_string(),
                deleted: true,
            });
        }
    }
}

fn encode_seq(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

fn decode_seq(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}

/// 内存实现的 RemoteStore
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemoteStore {
    state: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================
    // 故障注入与观测
    // ============================================================

    /// 下一次 `op` 调用返回指定错误（可多次调用排队）
    pub fn fail_next(&self, op: RemoteOp, err: RemoteError) {
        self.fail_after(op, 0, err);
    }

    /// 先放行 `skip` 次 `op` 调用，之后的一次返回指定错误
    pub fn fail_after(&self, op: RemoteOp, skip: usize, err: RemoteError) {
        let mut state = self.state.lock();
        let queue = state.pending_failures.entry(op).or_default();
        queue.extend(std::iter::repeat(None).take(skip));
        queue.push_back(Some(err));
    }

    /// 保存该 cloud_id 时总是返回逐条错误，直到清除
    pub fn set_record_error(&self, cloud_id: &str, err: RemoteError) {
        self.state.lock().record_errors.insert(cloud_id.to_string(), err);
    }

    pub fn clear_record_errors(&self) {
        self.state.lock().record_errors.clear();
    }

    /// 每页最多返回的变更数
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().page_size = page_size.max(1);
    }

    /// 每次调用前的人为延迟
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// 每次 save_records 调用实际写入的批次
    pub fn save_batches(&self) -> Vec<Vec<SyncRecord>> {
        self.state.lock().save_batches.clone()
    }

    pub fn record(&self, zone: &str, record_id: &str) -> Option<RemoteRecord> {
        self.state.lock().zones.get(zone).and_then(|z| z.records.get(record_id).cloned())
    }

    pub fn records(&self, zone: &str) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .zones
            .get(zone)
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn zone_exists(&self, zone: &str) -> bool {
        self.state.lock().zones.contains_key(zone)
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state.lock().subscriptions.values().cloned().collect()
    }

    /// 直接写入一条记录（模拟其他设备或历史副本）
    pub fn insert_raw(&self, zone: &str, record: RemoteRecord) {
        let mut state = self.state.lock();
        state.put_record(zone, record);
        state.touch_zone(zone, false);
    }

    /// 不经过调用计数直接建 zone
    pub fn create_zone_sync(&self, zone: &str) {
        let mut state = self.state.lock();
        if !state.zones.contains_key(zone) {
            state.zones.insert(zone.to_string(), ZoneState::default());
            state.touch_zone(zone, false);
        }
    }

    /// 删除整个 zone（模拟用户在其他设备上清空数据）
    pub fn delete_zone(&self, zone: &str) {
        let mut state = self.state.lock();
        state.zones.remove(zone);
        state.touch_zone(zone, true);
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create_zone(&self, zone: &str) -> RemoteResult<bool> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::CreateZone)?;
        if state.zones.contains_key(zone) {
            return Ok(false);
        }
        state.zones.insert(zone.to_string(), ZoneState::default());
        Ok(true)
    }

    async fn fetch_database_changes(&self, token: Option<&ChangeToken>) -> RemoteResult<DatabaseChanges> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::FetchDatabaseChanges)?;

        let since = token.map(|t| decode_seq(&t.0)).unwrap_or(0);
        let pending: Vec<&DatabaseChange> = state.database_log.iter().filter(|c| c.seq > since).collect();
        let page: Vec<&DatabaseChange> = pending.iter().take(state.page_size).copied().collect();
        let has_more = pending.len() > page.len();

        let mut changes = DatabaseChanges {
            has_more,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for change in &page {
            if !seen.insert((change.zone.clone(), change.deleted)) {
                continue;
            }
            if change.deleted {
                changes.deleted_zones.push(change.zone.clone());
            } else {
                changes.changed_zones.push(change.zone.clone());
            }
        }
        let last = page.last().map(|c| c.seq).unwrap_or(since.max(state.seq));
        changes.new_token = Some(ChangeToken(encode_seq(last)));
        Ok(changes)
    }

    async fn fetch_zone_changes(&self, zone: &str, token: Option<&ChangeToken>) -> RemoteResult<ZoneChanges> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::FetchZoneChanges)?;
        let page_size = state.page_size;

        let zone_state = state
            .zones
            .get(zone)
            .ok_or_else(|| RemoteError::ZoneNotFound(zone.to_string()))?;

        let since = token.map(|t| decode_seq(&t.0)).unwrap_or(0);
        let pending: Vec<&ZoneChange> = zone_state.log.iter().filter(|c| c.seq > since).collect();
        let page: Vec<&ZoneChange> = pending.iter().take(page_size).copied().collect();

        let mut changes = ZoneChanges {
            has_more: pending.len() > page.len(),
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for change in &page {
            if !seen.insert(change.record_id.clone()) {
                continue;
            }
            if change.deleted {
                changes.deleted_record_ids.push(change.record_id.clone());
            } else if let Some(record) = zone_state.records.get(&change.record_id) {
                changes.records.push(record.clone());
            }
        }
        let last = page.last().map(|c| c.seq).unwrap_or(since);
        changes.new_token = Some(ChangeToken(encode_seq(last)));
        Ok(changes)
    }

    async fn save_records(&self, zone: &str, records: Vec<SyncRecord>) -> RemoteResult<SaveResult> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::SaveRecords)?;
        if !state.zones.contains_key(zone) {
            return Err(RemoteError::ZoneNotFound(zone.to_string()));
        }

        let mut result = SaveResult::default();
        let mut written = Vec::new();
        for record in records {
            if let Some(err) = state.record_errors.get(&record.cloud_id).cloned() {
                result.errors.insert(record.cloud_id.clone(), err);
                continue;
            }
            result.saved.push(record.cloud_id.clone());
            written.push(record.clone());
            state.put_record(zone, RemoteRecord::new(record));
        }
        if !written.is_empty() {
            state.touch_zone(zone, false);
        }
        state.save_batches.push(written);
        Ok(result)
    }

    async fn delete_records(&self, zone: &str, record_ids: &[String]) -> RemoteResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::DeleteRecords)?;
        for record_id in record_ids {
            state.delete_record(zone, record_id);
        }
        if !record_ids.is_empty() {
            state.touch_zone(zone, false);
        }
        Ok(())
    }

    async fn query(&self, zone: &str, query: &RecordQuery) -> RemoteResult<QueryPage> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Query)?;

        let mut matched: Vec<RemoteRecord> = state
            .zones
            .get(zone)
            .map(|z| {
                z.records
                    .values()
                    .filter(|r| r.record.version.map(|v| v < query.older_than).unwrap_or(false))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by(|a, b| {
            a.record
                .version
                .cmp(&b.record.version)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });

        let offset = query.cursor.as_ref().map(|c| decode_seq(&c.0) as usize).unwrap_or(0);
        let limit = query.limit.max(1);
        let records: Vec<RemoteRecord> = matched.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + records.len();
        let next_cursor = if next < matched.len() {
            Some(QueryCursor(encode_seq(next as u64)))
        } else {
            None
        };
        Ok(QueryPage { records, next_cursor })
    }

    async fn list_subscriptions(&self) -> RemoteResult<Vec<Subscription>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::ListSubscriptions)?;
        Ok(state.subscriptions.values().cloned().collect())
    }

    async fn subscribe(&self, subscription: Subscription) -> RemoteResult<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.enter(RemoteOp::Subscribe)?;
        state.subscriptions.insert(subscription.id.clone(), subscription);
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> RemoteResult<()> {
        self.simulate_latency().await;
        self.state.lock().subscriptions.remove(subscription_id);
        Ok(())
    }
}
