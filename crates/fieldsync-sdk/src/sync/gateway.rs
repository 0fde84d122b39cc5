//! 远端存储网关
//!
//! SDK 只依赖 `RemoteGateway` trait，具体后端由宿主实现。
//! `MemoryGateway` 是进程内实现，用于测试和演示。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::RemoteError;
use crate::storage::queue::operation::{OperationKind, SyncOperation};

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// 远端网关（由宿主实现）
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// 应用一条写操作；upsert / update / delete 必须幂等
    async fn write(&self, op: &SyncOperation) -> RemoteResult<()>;

    /// 读取某个 scope 的当前远端状态
    async fn read(&self, collection: &str, scope_key: &str) -> RemoteResult<Value>;
}

#[derive(Debug)]
struct ScheduledFailure {
    remaining_successes: usize,
    error: RemoteError,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// (collection, record_id) -> 文档
    documents: BTreeMap<(String, String), Value>,
    applied: Vec<SyncOperation>,
    scheduled: Option<ScheduledFailure>,
    persistent_write_error: Option<RemoteError>,
    read_error: Option<RemoteError>,
}

/// 进程内远端实现
///
/// `read(collection, scope_key)` 优先返回以 scope_key 为 ID 的文档（快照模式），
/// 否则把集合内全部记录按 ID 排序后作为数组返回（日志模式）。
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    write_attempts: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置远端文档
    pub fn seed(&self, collection: &str, record_id: &str, value: Value) {
        self.state
            .lock()
            .documents
            .insert((collection.to_string(), record_id.to_string()), value);
    }

    /// 模拟断网：所有调用返回瞬时错误
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// 再成功 `successes` 次写入后，下一次写入失败一次
    pub fn fail_write_after(&self, successes: usize, error: RemoteError) {
        self.state.lock().scheduled = Some(ScheduledFailure {
            remaining_successes: successes,
            error,
        });
    }

    /// 持续拒绝所有写入，直到传入 None
    pub fn reject_writes(&self, error: Option<RemoteError>) {
        self.state.lock().persistent_write_error = error;
    }

    pub fn fail_reads(&self, error: Option<RemoteError>) {
        self.state.lock().read_error = error;
    }

    /// 已成功应用的写操作（按应用顺序）
    pub fn applied(&self) -> Vec<SyncOperation> {
        self.state.lock().applied.clone()
    }

    /// 写入尝试次数（含失败）
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn document(&self, collection: &str, record_id: &str) -> Option<Value> {
        self.state
            .lock()
            .documents
            .get(&(collection.to_string(), record_id.to_string()))
            .cloned()
    }

    fn record_id_for(op: &SyncOperation) -> String {
        if let Some(id) = &op.record_id {
            return id.clone();
        }
        op.payload
            .as_ref()
            .and_then(|p| p.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| op.op_id.to_string())
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn write(&self, op: &SyncOperation) -> RemoteResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("network unreachable"));
        }

        let mut state = self.state.lock();
        if let Some(error) = &state.persistent_write_error {
            return Err(error.clone());
        }
        if let Some(scheduled) = state.scheduled.as_mut() {
            if scheduled.remaining_successes == 0 {
                let error = scheduled.error.clone();
                state.scheduled = None;
                return Err(error);
            }
            scheduled.remaining_successes -= 1;
        }

        let key = (op.collection.clone(), Self::record_id_for(op));
        match op.kind {
            OperationKind::Insert | OperationKind::Upsert => {
                let payload = op.payload.clone().unwrap_or(Value::Null);
                state.documents.insert(key, payload);
            }
            OperationKind::Update => {
                let patch = op.payload.clone().unwrap_or(Value::Null);
                let merged = match (state.documents.get(&key), patch) {
                    (Some(Value::Object(existing)), Value::Object(patch)) => {
                        let mut merged = existing.clone();
                        merged.extend(patch);
                        Value::Object(merged)
                    }
                    (_, patch) => patch,
                };
                state.documents.insert(key, merged);
            }
            OperationKind::Delete => {
                state.documents.remove(&key);
            }
        }
        state.applied.push(op.clone());
        Ok(())
    }

    async fn read(&self, collection: &str, scope_key: &str) -> RemoteResult<Value> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("network unreachable"));
        }
        let state = self.state.lock();
        if let Some(error) = &state.read_error {
            return Err(error.clone());
        }
        if let Some(document) = state
            .documents
            .get(&(collection.to_string(), scope_key.to_string()))
        {
            return Ok(document.clone());
        }
        let records: Vec<Value> = state
            .documents
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, v)| v.clone())
            .collect();
        Ok(Value::Array(records))
    }
}
