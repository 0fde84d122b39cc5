//! 编辑会话
//!
//! 每个编辑页面持有一个 EditorSession：
//! - 加载远端状态（失败时回退到本地离线日志）
//! - 维护草稿与未保存修改标记
//! - 保存时根据网络状态直写远端或写入离线日志
//! - 通过事件总线感知后台重放结果，刷新待同步数 / 上次同步时间 / 错误

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dirty_tracker::DirtyTracker;
use crate::error::{FieldSyncError, LoadError, RemoteError, Result};
use crate::events::{EventFilter, EventManager, SyncEvent};
use crate::network::{ConnectivityMonitor, ConnectivityState};
use crate::storage::journal::JournalMode;
use crate::storage::queue::{FailureDisposition, MutationQueue, OperationKind, SyncOperation};
use crate::sync::{ReconcileOutcome, Reconciler, RemoteGateway};
use crate::utils::TimeFormatter;

/// 会话配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorConfig {
    pub collection: String,
    pub scope_key: String,
    pub mode: JournalMode,
}

impl EditorConfig {
    /// 整份表单编辑，保存时写入全量 upsert
    pub fn snapshot(collection: impl Into<String>, scope_key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            scope_key: scope_key.into(),
            mode: JournalMode::Snapshot,
        }
    }

    /// 记录列表编辑，保存时写入离散的 insert / update / delete
    pub fn log(collection: impl Into<String>, scope_key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            scope_key: scope_key.into(),
            mode: JournalMode::Log,
        }
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading,
    Ready,
    Saving,
    Saved,
    SavedOffline,
    LoadFailed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Saving => "saving",
            SessionState::Saved => "saved",
            SessionState::SavedOffline => "saved_offline",
            SessionState::LoadFailed => "load_failed",
        }
    }
}

/// 保存结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// 没有需要保存的修改
    NoChanges,
    /// 已写入远端
    Saved,
    /// 已写入本地离线日志；error 为本次保存遇到的远端错误（离线时为空）
    SavedOffline {
        pending_count: usize,
        error: Option<RemoteError>,
    },
}

/// UI 状态栏信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusInfo {
    pub connectivity: ConnectivityState,
    pub pending_count: usize,
    pub last_synced_at: Option<i64>,
    /// "2m ago" 形式的上次同步时间
    pub since_last_sync: Option<String>,
    pub last_error: Option<RemoteError>,
    pub disposition: Option<FailureDisposition>,
    pub message: String,
}

#[derive(Debug, Default)]
struct Indicators {
    last_synced_at: Option<i64>,
    last_error: Option<RemoteError>,
}

impl Indicators {
    fn mark_synced(&mut self) {
        self.last_synced_at = Some(TimeFormatter::now_millis());
        self.last_error = None;
    }
}

/// 单个编辑页面的会话
pub struct EditorSession {
    config: EditorConfig,
    gateway: Arc<dyn RemoteGateway>,
    monitor: Arc<ConnectivityMonitor>,
    queue: MutationQueue,
    reconciler: Arc<Reconciler>,
    tracker: DirtyTracker<Value>,
    /// log 模式下自上次保存以来的离散操作
    staged: Vec<SyncOperation>,
    state: SessionState,
    indicators: Arc<RwLock<Indicators>>,
    listener_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("dirty", &self.is_dirty())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl EditorSession {
    pub fn new(
        config: EditorConfig,
        gateway: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
        queue: MutationQueue,
        reconciler: Arc<Reconciler>,
        events: Option<Arc<EventManager>>,
    ) -> Self {
        let empty = Self::empty_draft(queue.mode());
        let indicators = Arc::new(RwLock::new(Indicators::default()));
        let listener_task = events
            .and_then(|events| Self::spawn_listener(&events, &config.scope_key, indicators.clone()));

        // 以已存储日志的模式为准
        let config = EditorConfig {
            mode: queue.mode(),
            ..config
        };

        Self {
            config,
            gateway,
            monitor,
            queue,
            reconciler,
            tracker: DirtyTracker::new(empty),
            staged: Vec::new(),
            state: SessionState::Idle,
            indicators,
            listener_task,
        }
    }

    fn empty_draft(mode: JournalMode) -> Value {
        match mode {
            JournalMode::Snapshot => Value::Object(Map::new()),
            JournalMode::Log => Value::Array(Vec::new()),
        }
    }

    /// 监听本 scope 的重放结果
    fn spawn_listener(
        events: &EventManager,
        scope_key: &str,
        indicators: Arc<RwLock<Indicators>>,
    ) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let mut receiver =
            events.subscribe_filtered(EventFilter::new().with_scope_keys(vec![scope_key.to_string()]));

        Some(handle.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(SyncEvent::ReconcileSucceeded { .. }) => indicators.write().mark_synced(),
                    Ok(SyncEvent::ReconcileFailed { error, .. }) => {
                        indicators.write().last_error = Some(error);
                    }
                    Ok(SyncEvent::JournalDiscarded { .. }) => {
                        indicators.write().last_error = None;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("会话事件积压，跳过 {} 条", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn scope_key(&self) -> &str {
        &self.config.scope_key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn draft(&self) -> &Value {
        self.tracker.draft()
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// 加载远端状态，并叠加尚未同步的离线日志
    ///
    /// 远端读取失败时，若本地有离线日志则以日志内容为准继续编辑，否则返回 `LoadError`。
    pub async fn load(&mut self) -> Result<()> {
        self.state = SessionState::Loading;

        if let Err(e) = self.queue.reload().await {
            // 存储错误只记录，按无离线日志处理
            error!("读取离线日志失败: scope={}, error={}", self.config.scope_key, e);
        }
        let pending = self.queue.pending_operations();

        let base = match self
            .gateway
            .read(&self.config.collection, &self.config.scope_key)
            .await
        {
            Ok(remote) => remote,
            Err(source) if !pending.is_empty() => {
                warn!(
                    "远端读取失败，使用本地离线日志: scope={}, pending={}, error={}",
                    self.config.scope_key,
                    pending.len(),
                    source
                );
                Self::empty_draft(self.config.mode)
            }
            Err(source) => {
                warn!("加载失败: scope={}, error={}", self.config.scope_key, source);
                self.state = SessionState::LoadFailed;
                return Err(FieldSyncError::Load(LoadError {
                    collection: self.config.collection.clone(),
                    scope_key: self.config.scope_key.clone(),
                    source,
                }));
            }
        };

        let view = match self.config.mode {
            JournalMode::Snapshot => {
                // 表单快照必须是对象；远端尚无该文档时从空表单开始
                let base = if base.is_object() {
                    base
                } else {
                    debug!("远端没有快照文档，使用空表单: scope={}", self.config.scope_key);
                    Self::empty_draft(JournalMode::Snapshot)
                };
                overlay_snapshot(base, &pending)
            }
            JournalMode::Log => fold_operations(base, &pending),
        };
        self.tracker.reset(view);
        self.staged.clear();
        self.state = SessionState::Ready;
        info!(
            "会话已加载: scope={}, mode={:?}, pending={}",
            self.config.scope_key,
            self.config.mode,
            pending.len()
        );
        Ok(())
    }

    /// 只有加载成功后才能编辑和保存，避免用空草稿覆盖远端数据
    fn ensure_loaded(&self, what: &str) -> Result<()> {
        match self.state {
            SessionState::Ready | SessionState::Saved | SessionState::SavedOffline => Ok(()),
            other => Err(FieldSyncError::InvalidState(format!(
                "{} is not available while session is {}",
                what,
                other.as_str()
            ))),
        }
    }

    fn ensure_mode(&self, mode: JournalMode, what: &str) -> Result<()> {
        self.ensure_loaded(what)?;
        if self.config.mode != mode {
            return Err(FieldSyncError::InvalidState(format!(
                "{} is not available in {:?} mode",
                what, self.config.mode
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        if matches!(self.state, SessionState::Saved | SessionState::SavedOffline) {
            self.state = SessionState::Ready;
        }
    }

    /// 原地修改草稿（snapshot 模式）
    pub fn edit_draft<R>(&mut self, f: impl FnOnce(&mut Value) -> R) -> Result<R> {
        self.ensure_mode(JournalMode::Snapshot, "edit_draft")?;
        self.touch();
        Ok(self.tracker.edit(f))
    }

    /// 整体替换草稿（snapshot 模式）
    pub fn replace_draft(&mut self, draft: Value) -> Result<()> {
        self.ensure_mode(JournalMode::Snapshot, "replace_draft")?;
        self.touch();
        self.tracker.set_draft(draft);
        Ok(())
    }

    /// 新增记录（log 模式）
    pub fn add_record(&mut self, record: Value) -> Result<()> {
        self.ensure_mode(JournalMode::Log, "add_record")?;
        if !record.is_object() {
            return Err(FieldSyncError::InvalidOperation(
                "record must be a JSON object".to_string(),
            ));
        }
        // 草稿里已有同 ID 的记录时按 upsert 提交，避免远端插入冲突
        let existing_id = record_id_of(&record).filter(|id| {
            self.tracker
                .draft()
                .as_array()
                .is_some_and(|records| records.iter().any(|r| record_id_of(r).as_ref() == Some(id)))
        });
        self.touch();
        self.tracker.edit(|draft| push_record(draft, record.clone()));
        let op = match existing_id {
            Some(id) => SyncOperation::upsert(self.config.collection.clone(), Some(id), record),
            None => SyncOperation::insert(self.config.collection.clone(), record),
        };
        self.staged.push(op);
        Ok(())
    }

    /// 修改记录的部分字段（log 模式）
    pub fn update_record(&mut self, record_id: &str, patch: Value) -> Result<()> {
        self.ensure_mode(JournalMode::Log, "update_record")?;
        let Value::Object(fields) = &patch else {
            return Err(FieldSyncError::InvalidOperation(
                "patch must be a JSON object".to_string(),
            ));
        };
        let fields = fields.clone();
        let found = self.tracker.edit(|draft| merge_record(draft, record_id, fields));
        if !found {
            return Err(FieldSyncError::InvalidOperation(format!(
                "record {} not found",
                record_id
            )));
        }
        self.touch();
        self.staged.push(SyncOperation::update(
            self.config.collection.clone(),
            record_id,
            patch,
        ));
        Ok(())
    }

    /// 删除记录（log 模式）
    pub fn remove_record(&mut self, record_id: &str) -> Result<()> {
        self.ensure_mode(JournalMode::Log, "remove_record")?;
        let removed = self.tracker.edit(|draft| remove_record(draft, record_id));
        if !removed {
            return Err(FieldSyncError::InvalidOperation(format!(
                "record {} not found",
                record_id
            )));
        }
        self.touch();
        self.staged
            .push(SyncOperation::delete(self.config.collection.clone(), record_id));
        Ok(())
    }

    /// 放弃未保存的修改
    pub fn discard_changes(&mut self) {
        self.tracker.discard_changes();
        self.staged.clear();
        self.touch();
    }

    fn build_operations(&mut self) -> Vec<SyncOperation> {
        match self.config.mode {
            JournalMode::Snapshot => vec![SyncOperation::upsert(
                self.config.collection.clone(),
                Some(self.config.scope_key.clone()),
                self.tracker.draft().clone(),
            )],
            JournalMode::Log => std::mem::take(&mut self.staged),
        }
    }

    /// 保存
    ///
    /// - 在线且没有待同步日志：直写远端，失败则转为离线缓冲
    /// - 在线但仍有待同步日志：先追加到日志再重放，保持顺序
    /// - 离线：追加到日志
    ///
    /// 远端写入和重放在独立任务中执行，`save()` 被丢弃时它们照常完成。
    pub async fn save(&mut self) -> Result<SaveOutcome> {
        self.ensure_loaded("save")?;
        if !self.tracker.is_dirty() && self.staged.is_empty() {
            return Ok(SaveOutcome::NoChanges);
        }

        let previous_state = self.state;
        self.state = SessionState::Saving;
        let ops = self.build_operations();
        let online = self.monitor.is_online();

        if online && self.queue.pending_count() == 0 {
            let unsaved = ops.clone();
            let task = tokio::spawn(write_through(
                self.gateway.clone(),
                self.queue.clone(),
                ops,
            ));
            let written = match task.await {
                Ok(written) => written,
                Err(e) => {
                    self.restore_unsaved(unsaved, previous_state);
                    return Err(e.into());
                }
            };

            return match written {
                DirectWrite::Written(count) => {
                    self.tracker.mark_saved();
                    self.indicators.write().mark_synced();
                    self.state = SessionState::Saved;
                    info!("已直接保存到远端: scope={}, ops={}", self.config.scope_key, count);
                    Ok(SaveOutcome::Saved)
                }
                DirectWrite::Buffered(error) => {
                    self.tracker.mark_saved();
                    self.indicators.write().last_error = Some(error.clone());
                    self.state = SessionState::SavedOffline;
                    Ok(SaveOutcome::SavedOffline {
                        pending_count: self.queue.pending_count(),
                        error: Some(error),
                    })
                }
                DirectWrite::BufferFailed {
                    error,
                    unsaved,
                    cause,
                } => {
                    self.indicators.write().last_error = Some(error);
                    self.restore_unsaved(unsaved, previous_state);
                    Err(cause)
                }
            };
        }

        self.buffer(ops, previous_state).await?;

        if online {
            // 已有待同步日志：立即重放，保证新修改排在旧修改之后
            match self.reconcile_detached().await {
                Ok(outcome) => {
                    self.apply_outcome(&outcome);
                    if let ReconcileOutcome::Pending {
                        error,
                        pending_count,
                    } = outcome
                    {
                        self.state = SessionState::SavedOffline;
                        return Ok(SaveOutcome::SavedOffline {
                            pending_count,
                            error: Some(error),
                        });
                    }
                    self.state = SessionState::Saved;
                    return Ok(SaveOutcome::Saved);
                }
                Err(e) => {
                    error!("重放时本地存储出错: scope={}, error={}", self.config.scope_key, e);
                }
            }
        }

        self.state = SessionState::SavedOffline;
        Ok(SaveOutcome::SavedOffline {
            pending_count: self.queue.pending_count(),
            error: None,
        })
    }

    /// 写入离线日志；存储失败时恢复未保存状态
    async fn buffer(&mut self, ops: Vec<SyncOperation>, previous_state: SessionState) -> Result<()> {
        if let Err((index, e)) = append_all(&self.queue, &ops).await {
            self.restore_unsaved(ops[index..].to_vec(), previous_state);
            return Err(e);
        }
        self.tracker.mark_saved();
        Ok(())
    }

    /// 未能写入日志的操作放回暂存区，草稿保持未保存
    fn restore_unsaved(&mut self, unsaved: Vec<SyncOperation>, previous_state: SessionState) {
        if self.config.mode == JournalMode::Log {
            let mut unsaved = unsaved;
            unsaved.append(&mut self.staged);
            self.staged = unsaved;
        }
        self.state = match previous_state {
            SessionState::Saved | SessionState::SavedOffline => SessionState::Ready,
            other => other,
        };
    }

    /// 在独立任务中重放本 scope；调用方被丢弃时重放在后台跑完
    async fn reconcile_detached(&self) -> Result<ReconcileOutcome> {
        let reconciler = self.reconciler.clone();
        let scope_key = self.config.scope_key.clone();
        tokio::spawn(async move { reconciler.reconcile(&scope_key).await }).await?
    }

    fn apply_outcome(&self, outcome: &ReconcileOutcome) {
        let mut indicators = self.indicators.write();
        match outcome {
            ReconcileOutcome::Synced { .. } => indicators.mark_synced(),
            ReconcileOutcome::NothingPending => indicators.last_error = None,
            ReconcileOutcome::Pending { error, .. } => indicators.last_error = Some(error.clone()),
        }
    }

    /// 用户手动重试同步
    pub async fn retry_sync(&mut self) -> Result<ReconcileOutcome> {
        let outcome = self.reconcile_detached().await?;
        self.apply_outcome(&outcome);
        Ok(outcome)
    }

    /// 丢弃被远端拒绝的离线修改；之后可调用 `load()` 重新读取远端状态
    pub async fn discard_offline_changes(&mut self) -> Result<()> {
        self.queue.discard().await?;
        self.indicators.write().last_error = None;
        Ok(())
    }

    /// 回到 Ready（例如"已保存"提示消失后）
    pub fn settle(&mut self) {
        self.touch();
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn connectivity_label(&self) -> &'static str {
        self.monitor.current().label()
    }

    pub fn last_synced_at(&self) -> Option<i64> {
        self.indicators.read().last_synced_at
    }

    /// 最近一次同步失败的原因；没有待同步操作时为空
    pub fn last_error(&self) -> Option<RemoteError> {
        if self.pending_count() == 0 {
            return None;
        }
        self.indicators.read().last_error.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty()
    }

    /// 导航守卫：没有未保存的修改时才能离开
    pub fn can_leave(&self) -> bool {
        !self.is_dirty()
    }

    pub fn status_info(&self) -> SyncStatusInfo {
        let connectivity = self.monitor.current();
        let pending_count = self.pending_count();
        let last_synced_at = self.last_synced_at();
        let last_error = self.last_error();
        let disposition = last_error.as_ref().map(FailureDisposition::from_remote);

        let message = if pending_count == 0 {
            "All changes synced".to_string()
        } else if let Some(disposition) = disposition {
            format!("{} unsynced change(s): {}", pending_count, disposition.hint())
        } else if connectivity.is_online() {
            format!("Syncing {} change(s)", pending_count)
        } else {
            format!("Offline: {} change(s) saved on this device", pending_count)
        };

        SyncStatusInfo {
            connectivity,
            pending_count,
            last_synced_at,
            since_last_sync: last_synced_at
                .map(|t| TimeFormatter::format_elapsed(TimeFormatter::seconds_since(t))),
            last_error,
            disposition,
            message,
        }
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        // 只停止事件监听；已经开始的写入和重放不受影响
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }
}

/// 直写远端的结果
enum DirectWrite {
    Written(usize),
    /// 远端失败，剩余操作已写入离线日志
    Buffered(RemoteError),
    /// 远端失败，且剩余操作未能全部写入日志
    BufferFailed {
        error: RemoteError,
        unsaved: Vec<SyncOperation>,
        cause: FieldSyncError,
    },
}

async fn write_through(
    gateway: Arc<dyn RemoteGateway>,
    queue: MutationQueue,
    ops: Vec<SyncOperation>,
) -> DirectWrite {
    for (index, op) in ops.iter().enumerate() {
        if let Err(error) = gateway.write(op).await {
            warn!(
                "直写远端失败，转为离线缓冲: scope={}, error={}",
                queue.scope_key(),
                error
            );
            let remaining = &ops[index..];
            return match append_all(&queue, remaining).await {
                Ok(()) => DirectWrite::Buffered(error),
                Err((failed, cause)) => DirectWrite::BufferFailed {
                    error,
                    unsaved: remaining[failed..].to_vec(),
                    cause,
                },
            };
        }
    }
    DirectWrite::Written(ops.len())
}

/// 依次追加；失败时返回失败操作的下标
async fn append_all(
    queue: &MutationQueue,
    ops: &[SyncOperation],
) -> std::result::Result<(), (usize, FieldSyncError)> {
    for (index, op) in ops.iter().enumerate() {
        if let Err(e) = queue.append(op.clone()).await {
            error!(
                "写入离线日志失败，保留未保存状态: scope={}, error={}",
                queue.scope_key(),
                e
            );
            return Err((index, e));
        }
    }
    Ok(())
}

fn record_id_of(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// 插入记录；同 ID 的记录被替换
fn push_record(draft: &mut Value, record: Value) {
    let Value::Array(records) = draft else {
        *draft = Value::Array(vec![record]);
        return;
    };
    let position = record_id_of(&record)
        .and_then(|id| records.iter().position(|r| record_id_of(r).as_deref() == Some(id.as_str())));
    match position {
        Some(position) => records[position] = record,
        None => records.push(record),
    }
}

fn merge_record(draft: &mut Value, record_id: &str, fields: Map<String, Value>) -> bool {
    let Value::Array(records) = draft else {
        return false;
    };
    let Some(record) = records
        .iter_mut()
        .find(|r| record_id_of(r).as_deref() == Some(record_id))
    else {
        return false;
    };
    match record {
        Value::Object(existing) => existing.extend(fields),
        other => *other = Value::Object(fields),
    }
    true
}

fn remove_record(draft: &mut Value, record_id: &str) -> bool {
    let Value::Array(records) = draft else {
        return false;
    };
    let before = records.len();
    records.retain(|r| record_id_of(r).as_deref() != Some(record_id));
    before != records.len()
}

/// 快照模式：最新一条缓冲的全量数据覆盖远端状态
fn overlay_snapshot(base: Value, pending: &[SyncOperation]) -> Value {
    pending
        .iter()
        .rev()
        .find_map(|op| op.payload.clone())
        .unwrap_or(base)
}

/// 日志模式：把待重放操作依次应用到记录列表上
fn fold_operations(base: Value, pending: &[SyncOperation]) -> Value {
    let mut view = match base {
        Value::Array(records) => Value::Array(records),
        _ => Value::Array(Vec::new()),
    };
    for op in pending {
        match op.kind {
            OperationKind::Insert | OperationKind::Upsert => {
                if let Some(payload) = &op.payload {
                    push_record(&mut view, payload.clone());
                }
            }
            OperationKind::Update => {
                if let (Some(id), Some(Value::Object(fields))) = (&op.record_id, &op.payload) {
                    merge_record(&mut view, id, fields.clone());
                }
            }
            OperationKind::Delete => {
                if let Some(id) = &op.record_id {
                    remove_record(&mut view, id);
                }
            }
        }
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManualConnectivityListener;
    use crate::storage::journal::PersistentJournal;
    use crate::storage::kv::KvStore;
    use crate::sync::{MemoryGateway, RemoteResult, ScopeLocks};
    use serde_json::json;
    use std::time::Duration;

    /// 每次写入前等待一段时间的网关，用于模拟页面关闭时仍在进行的写入
    struct SlowGateway {
        inner: Arc<MemoryGateway>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl RemoteGateway for SlowGateway {
        async fn write(&self, op: &SyncOperation) -> RemoteResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.write(op).await
        }

        async fn read(&self, collection: &str, scope_key: &str) -> RemoteResult<Value> {
            self.inner.read(collection, scope_key).await
        }
    }

    struct Harness {
        gateway: Arc<MemoryGateway>,
        remote: Arc<dyn RemoteGateway>,
        monitor: Arc<ConnectivityMonitor>,
        journal: Arc<PersistentJournal>,
        reconciler: Arc<Reconciler>,
        locks: ScopeLocks,
    }

    impl Harness {
        async fn new(online: bool) -> Self {
            let gateway = Arc::new(MemoryGateway::new());
            Self::with_remote(online, gateway.clone(), gateway).await
        }

        async fn slow(online: bool, delay: Duration) -> Self {
            let gateway = Arc::new(MemoryGateway::new());
            let remote = Arc::new(SlowGateway {
                inner: gateway.clone(),
                delay,
            });
            Self::with_remote(online, gateway, remote).await
        }

        async fn with_remote(
            online: bool,
            gateway: Arc<MemoryGateway>,
            remote: Arc<dyn RemoteGateway>,
        ) -> Self {
            let kv = KvStore::temporary().unwrap();
            let journal = Arc::new(PersistentJournal::new(&kv, "test", false).unwrap());
            let locks = ScopeLocks::new();
            let reconciler = Arc::new(Reconciler::new(
                journal.clone(),
                remote.clone(),
                locks.clone(),
            ));
            let listener = Arc::new(ManualConnectivityListener::new(Some(online)));
            let monitor = Arc::new(ConnectivityMonitor::new(listener).await);
            Self {
                gateway,
                remote,
                monitor,
                journal,
                reconciler,
                locks,
            }
        }

        async fn session(&self, config: EditorConfig) -> EditorSession {
            let queue = MutationQueue::open(
                self.journal.clone(),
                self.locks.clone(),
                config.scope_key.clone(),
                config.mode,
            )
            .await
            .unwrap();
            EditorSession::new(
                config,
                self.remote.clone(),
                self.monitor.clone(),
                queue,
                self.reconciler.clone(),
                None,
            )
        }
    }

    #[tokio::test]
    async fn test_load_then_edit_marks_dirty() {
        let h = Harness::new(true).await;
        h.gateway
            .seed("equipment", "equipment:site-42", json!({"count": 3}));
        let mut session = h
            .session(EditorConfig::snapshot("equipment", "equipment:site-42"))
            .await;

        assert_eq!(session.state(), SessionState::Idle);
        session.load().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.is_dirty());
        assert!(session.can_leave());

        session.edit_draft(|d| d["count"] = json!(5)).unwrap();
        assert!(session.is_dirty());
        assert!(!session.can_leave());
    }

    #[tokio::test]
    async fn test_online_save_writes_directly() {
        let h = Harness::new(true).await;
        h.gateway
            .seed("equipment", "equipment:site-42", json!({"count": 3}));
        let mut session = h
            .session(EditorConfig::snapshot("equipment", "equipment:site-42"))
            .await;
        session.load().await.unwrap();
        session.edit_draft(|d| d["count"] = json!(4)).unwrap();

        assert_eq!(session.save().await.unwrap(), SaveOutcome::Saved);
        assert_eq!(session.state(), SessionState::Saved);
        assert!(!session.is_dirty());
        assert!(session.last_synced_at().is_some());
        assert_eq!(
            h.gateway.document("equipment", "equipment:site-42"),
            Some(json!({"count": 4}))
        );
        assert!(h.journal.pending_scopes().await.unwrap().is_empty());

        assert_eq!(session.save().await.unwrap(), SaveOutcome::NoChanges);
    }

    #[tokio::test]
    async fn test_failed_direct_write_is_buffered() {
        let h = Harness::new(true).await;
        let mut session = h
            .session(EditorConfig::snapshot("equipment", "equipment:site-42"))
            .await;
        session.load().await.unwrap();
        assert_eq!(session.draft(), &json!({}));
        h.gateway.set_offline(true);

        session.replace_draft(json!({"count": 9})).unwrap();
        let outcome = session.save().await.unwrap();
        assert!(matches!(
            outcome,
            SaveOutcome::SavedOffline { pending_count: 1, error: Some(ref e) } if e.is_transient()
        ));
        assert_eq!(session.state(), SessionState::SavedOffline);
        assert!(session.can_leave());
        assert!(session.status_info().message.contains("retry"));
    }

    #[tokio::test]
    async fn test_load_failure_falls_back_to_journal() {
        let h = Harness::new(false).await;
        let mut session = h.session(EditorConfig::log("devices", "devices:site-9")).await;
        h.gateway.set_offline(true);
        assert!(matches!(session.load().await, Err(FieldSyncError::Load(_))));
        assert_eq!(session.state(), SessionState::LoadFailed);

        h.gateway.set_offline(false);
        session.load().await.unwrap();
        session.add_record(json!({"id": "NET-7", "port": 1})).unwrap();
        session.update_record("NET-7", json!({"port": 2})).unwrap();
        session.save().await.unwrap();
        drop(session);

        h.gateway.set_offline(true);
        let mut reopened = h.session(EditorConfig::log("devices", "devices:site-9")).await;
        reopened.load().await.unwrap();
        assert_eq!(reopened.draft(), &json!([{"id": "NET-7", "port": 2}]));
        assert_eq!(reopened.pending_count(), 2);
        assert!(!reopened.is_dirty());
    }

    #[tokio::test]
    async fn test_mode_specific_edits_are_guarded() {
        let h = Harness::new(true).await;
        let mut snapshot = h
            .session(EditorConfig::snapshot("equipment", "equipment:site-1"))
            .await;
        snapshot.load().await.unwrap();
        assert!(snapshot.add_record(json!({"id": 1})).is_err());

        let mut log = h.session(EditorConfig::log("devices", "devices:site-1")).await;
        log.load().await.unwrap();
        assert!(log.replace_draft(json!({})).is_err());
        assert!(log.update_record("missing", json!({"a": 1})).is_err());
        assert!(log.add_record(json!("not an object")).is_err());
    }

    #[tokio::test]
    async fn test_failed_load_rejects_edits_and_keeps_remote() {
        let h = Harness::new(true).await;
        let remote = json!({"count": 3, "site": "North", "serial": "X1"});
        h.gateway.seed("equipment", "equipment:site-42", remote.clone());
        h.gateway.fail_reads(Some(RemoteError::transient("timeout")));
        let mut session = h
            .session(EditorConfig::snapshot("equipment", "equipment:site-42"))
            .await;

        assert!(session.edit_draft(|d| d["count"] = json!(1)).is_err());
        assert!(session.load().await.is_err());
        assert_eq!(session.state(), SessionState::LoadFailed);

        assert!(matches!(
            session.edit_draft(|d| d["count"] = json!(5)),
            Err(FieldSyncError::InvalidState(_))
        ));
        assert!(session.replace_draft(json!({"count": 5})).is_err());
        assert!(matches!(session.save().await, Err(FieldSyncError::InvalidState(_))));
        assert_eq!(session.state(), SessionState::LoadFailed);
        assert_eq!(h.gateway.write_attempts(), 0);
        assert_eq!(h.gateway.document("equipment", "equipment:site-42"), Some(remote));

        // 读取恢复后可以重新加载并编辑
        h.gateway.fail_reads(None);
        session.load().await.unwrap();
        session.edit_draft(|d| d["count"] = json!(5)).unwrap();
        assert_eq!(session.save().await.unwrap(), SaveOutcome::Saved);
        assert_eq!(
            h.gateway.document("equipment", "equipment:site-42"),
            Some(json!({"count": 5, "site": "North", "serial": "X1"}))
        );
    }

    #[tokio::test]
    async fn test_retry_keeps_draining_after_caller_is_dropped() {
        let h = Harness::slow(false, Duration::from_millis(100)).await;
        let mut session = h.session(EditorConfig::log("devices", "devices:site-9")).await;
        session.load().await.unwrap();
        session.add_record(json!({"id": "NET-7"})).unwrap();
        session.save().await.unwrap();
        assert_eq!(session.pending_count(), 1);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), session.retry_sync()).await;
        assert!(cancelled.is_err());
        drop(session);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.gateway.applied().len(), 1);
        assert_eq!(h.journal.pending_count("devices:site-9"), 0);
    }

    #[tokio::test]
    async fn test_direct_write_completes_after_caller_is_dropped() {
        let h = Harness::slow(true, Duration::from_millis(100)).await;
        let mut session = h
            .session(EditorConfig::snapshot("equipment", "equipment:site-42"))
            .await;
        session.load().await.unwrap();
        session.replace_draft(json!({"count": 7})).unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), session.save()).await;
        assert!(cancelled.is_err());
        drop(session);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            h.gateway.document("equipment", "equipment:site-42"),
            Some(json!({"count": 7}))
        );
    }

    #[tokio::test]
    async fn test_adding_existing_id_stages_upsert() {
        let h = Harness::new(false).await;
        h.gateway
            .seed("devices", "NET-7", json!({"id": "NET-7", "port": 1}));
        let mut session = h.session(EditorConfig::log("devices", "devices:site-9")).await;
        session.load().await.unwrap();

        session.add_record(json!({"id": "NET-7", "port": 9})).unwrap();
        session.add_record(json!({"id": "NET-8"})).unwrap();
        session.save().await.unwrap();

        let pending = session.queue().pending_operations();
        assert_eq!(pending[0].kind, OperationKind::Upsert);
        assert_eq!(pending[0].record_id.as_deref(), Some("NET-7"));
        assert!(pending[0].validate().is_ok());
        assert_eq!(pending[1].kind, OperationKind::Insert);
        assert_eq!(
            session.draft(),
            &json!([{"id": "NET-7", "port": 9}, {"id": "NET-8"}])
        );
    }

    #[test]
    fn test_fold_operations() {
        let ops = vec![
            SyncOperation::insert("devices", json!({"id": "A", "port": 1})),
            SyncOperation::insert("devices", json!({"id": "B", "port": 2})),
            SyncOperation::update("devices", "A", json!({"port": 5})),
            SyncOperation::delete("devices", "B"),
        ];
        let view = fold_operations(json!([{"id": "C"}]), &ops);
        assert_eq!(view, json!([{"id": "C"}, {"id": "A", "port": 5}]));
    }
}
