//! 离线变更日志持久化
//!
//! 每个 feature 使用独立的命名空间 `offline_journal:{feature}`，
//! 前缀扫描不会读到其它 feature 的日志。
//!
//! Key 规范（同一命名空间内）：
//! - `{feature}_offline_{scope}`：序列化后的 MutationJournal
//! - `{feature}_offline_{scope}#cursor`：最后一次成功重放的 sequence
//! - `{feature}_offline_{scope}#seq`：该 scope 分配过的最大 sequence（清空日志后仍保留）
//!
//! scope key 不允许包含 `#`，保证三类 key 不会互相冲突。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FieldSyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::storage::kv::{KvBatch, KvNamespace, KvStore};
use crate::storage::queue::operation::SyncOperation;
use crate::utils::TimeFormatter;

const NAMESPACE: &str = "offline_journal";
const CURSOR_SUFFIX: &str = "#cursor";
const SEQ_SUFFIX: &str = "#seq";

/// 日志模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// 最多一条全量 upsert，每次编辑覆盖上一条
    Snapshot,
    /// 追加式的 insert/update/delete 列表，直到被完整重放
    Log,
}

/// 一个 scope 的持久化单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationJournal {
    pub scope_key: String,
    pub mode: JournalMode,
    /// 本 scope 最后分配的 sequence
    pub sequence_cursor: u64,
    pub operations: Vec<SyncOperation>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl MutationJournal {
    /// 新建空日志，sequence 从 `sequence_floor + 1` 开始分配
    pub fn new(scope_key: impl Into<String>, mode: JournalMode, sequence_floor: u64) -> Self {
        let now = TimeFormatter::now_millis();
        Self {
            scope_key: scope_key.into(),
            mode,
            sequence_cursor: sequence_floor,
            operations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 分配下一个 sequence 并按模式写入，返回分配的 sequence
    pub fn push(&mut self, mut op: SyncOperation) -> u64 {
        self.sequence_cursor += 1;
        op.sequence = self.sequence_cursor;
        match self.mode {
            JournalMode::Snapshot => {
                self.operations.clear();
                self.operations.push(op);
            }
            JournalMode::Log => self.operations.push(op),
        }
        self.updated_at = TimeFormatter::now_millis();
        self.sequence_cursor
    }

    /// 重放游标之后仍待应用的操作（按 sequence 顺序）
    pub fn pending_after(&self, replay_cursor: Option<u64>) -> Vec<&SyncOperation> {
        let cursor = replay_cursor.unwrap_or(0);
        self.operations
            .iter()
            .filter(|op| op.sequence > cursor)
            .collect()
    }

    pub fn pending_count(&self, replay_cursor: Option<u64>) -> usize {
        let cursor = replay_cursor.unwrap_or(0);
        self.operations.iter().filter(|op| op.sequence > cursor).count()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// 结构校验：能解析但不自洽的日志同样视为损坏
    fn check_well_formed(&self, expected_scope: &str) -> std::result::Result<(), String> {
        if self.scope_key != expected_scope {
            return Err(format!(
                "stored under {} but claims scope {}",
                expected_scope, self.scope_key
            ));
        }
        if self.mode == JournalMode::Snapshot && self.operations.len() > 1 {
            return Err(format!(
                "snapshot journal holds {} operations",
                self.operations.len()
            ));
        }
        let mut previous = 0u64;
        for op in &self.operations {
            if op.sequence <= previous {
                return Err(format!(
                    "sequence {} does not follow {}",
                    op.sequence, previous
                ));
            }
            if op.sequence > self.sequence_cursor {
                return Err(format!(
                    "sequence {} exceeds cursor {}",
                    op.sequence, self.sequence_cursor
                ));
            }
            op.validate().map_err(|e| e.to_string())?;
            previous = op.sequence;
        }
        Ok(())
    }
}

/// scope key 合法性校验
pub fn validate_scope_key(scope_key: &str) -> Result<()> {
    if scope_key.trim().is_empty() {
        return Err(FieldSyncError::InvalidOperation(
            "scope key must not be empty".to_string(),
        ));
    }
    if scope_key.contains('#') {
        return Err(FieldSyncError::InvalidOperation(format!(
            "scope key must not contain '#': {}",
            scope_key
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct CachedScope {
    journal: Option<MutationJournal>,
    replay_cursor: Option<u64>,
}

/// 离线日志存储（写穿缓存 + sled）
#[derive(Debug)]
pub struct PersistentJournal {
    ns: KvNamespace,
    feature: String,
    flush_on_write: bool,
    cache: RwLock<HashMap<String, CachedScope>>,
    events: Option<Arc<EventManager>>,
}

impl PersistentJournal {
    pub fn new(kv: &KvStore, feature: impl Into<String>, flush_on_write: bool) -> Result<Self> {
        let feature = feature.into();
        if feature.trim().is_empty() || feature.contains('#') {
            return Err(FieldSyncError::Config(format!(
                "invalid feature prefix: {:?}",
                feature
            )));
        }
        Ok(Self {
            ns: kv.namespace(&format!("{}:{}", NAMESPACE, feature))?,
            feature,
            flush_on_write,
            cache: RwLock::new(HashMap::new()),
            events: None,
        })
    }

    /// 挂载事件管理器（丢弃损坏日志时广播事件）
    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    fn journal_prefix(&self) -> String {
        format!("{}_offline_", self.feature)
    }

    fn journal_key(&self, scope_key: &str) -> String {
        format!("{}_offline_{}", self.feature, scope_key)
    }

    fn cursor_key(&self, scope_key: &str) -> String {
        format!("{}{}", self.journal_key(scope_key), CURSOR_SUFFIX)
    }

    fn seq_key(&self, scope_key: &str) -> String {
        format!("{}{}", self.journal_key(scope_key), SEQ_SUFFIX)
    }

    async fn maybe_flush(&self) -> Result<()> {
        if self.flush_on_write {
            self.ns.flush().await?;
        }
        Ok(())
    }

    /// 读取日志；无法解析或结构不自洽时返回 `StorageCorrupt`
    pub async fn load(&self, scope_key: &str) -> Result<Option<MutationJournal>> {
        validate_scope_key(scope_key)?;

        let raw = self.ns.get_raw(self.journal_key(scope_key)).await?;
        let Some(bytes) = raw else {
            self.cache.write().remove(scope_key);
            return Ok(None);
        };

        let journal: MutationJournal =
            serde_json::from_slice(&bytes).map_err(|e| FieldSyncError::StorageCorrupt {
                scope_key: scope_key.to_string(),
                reason: e.to_string(),
            })?;
        journal
            .check_well_formed(scope_key)
            .map_err(|reason| FieldSyncError::StorageCorrupt {
                scope_key: scope_key.to_string(),
                reason,
            })?;

        let replay_cursor = self
            .ns
            .get::<_, u64>(self.cursor_key(scope_key))
            .await
            .map_err(|e| FieldSyncError::StorageCorrupt {
                scope_key: scope_key.to_string(),
                reason: format!("replay cursor: {}", e),
            })?;

        self.cache.write().insert(
            scope_key.to_string(),
            CachedScope {
                journal: Some(journal.clone()),
                replay_cursor,
            },
        );

        Ok(Some(journal))
    }

    /// 读取日志；损坏时丢弃并返回 None，其它存储错误继续向上传递
    pub async fn load_recovering(&self, scope_key: &str) -> Result<Option<MutationJournal>> {
        match self.load(scope_key).await {
            Ok(journal) => Ok(journal),
            Err(FieldSyncError::StorageCorrupt { scope_key, reason }) => {
                warn!("离线日志已损坏，丢弃: scope={}, reason={}", scope_key, reason);
                self.discard(&scope_key).await?;
                if let Some(events) = &self.events {
                    events
                        .emit(event_builders::journal_discarded(&scope_key, &reason))
                        .await;
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 读取日志，任何错误都按"没有待同步日志"处理并记录日志
    pub async fn load_or_discard(&self, scope_key: &str) -> Option<MutationJournal> {
        match self.load_recovering(scope_key).await {
            Ok(journal) => journal,
            Err(e) => {
                warn!("读取离线日志失败，按无日志处理: scope={}, error={}", scope_key, e);
                None
            }
        }
    }

    /// 整体覆盖写入日志（与 sequence 高水位同批原子提交）
    pub async fn save(&self, journal: &MutationJournal) -> Result<()> {
        validate_scope_key(&journal.scope_key)?;
        let scope_key = journal.scope_key.as_str();

        let high_water = self.sequence_high_water(scope_key).await?;
        let mut batch = KvBatch::new();
        batch.set(self.journal_key(scope_key), journal)?;
        batch.set(self.seq_key(scope_key), &high_water.max(journal.sequence_cursor))?;
        self.ns.apply_batch(batch).await?;
        self.maybe_flush().await?;

        let mut cache = self.cache.write();
        let entry = cache.entry(scope_key.to_string()).or_default();
        entry.journal = Some(journal.clone());

        debug!(
            "离线日志已保存: scope={}, operations={}, cursor={}",
            scope_key,
            journal.operations.len(),
            journal.sequence_cursor
        );
        Ok(())
    }

    /// 完整重放成功后删除日志和重放游标，保留 sequence 高水位
    pub async fn clear(&self, scope_key: &str) -> Result<()> {
        validate_scope_key(scope_key)?;

        let cached_cursor = self
            .cache
            .read()
            .get(scope_key)
            .and_then(|c| c.journal.as_ref().map(|j| j.sequence_cursor))
            .unwrap_or(0);
        let high_water = self.sequence_high_water(scope_key).await?;

        let mut batch = KvBatch::new();
        batch.set(self.seq_key(scope_key), &high_water.max(cached_cursor))?;
        batch.remove(self.journal_key(scope_key));
        batch.remove(self.cursor_key(scope_key));
        self.ns.apply_batch(batch).await?;
        self.maybe_flush().await?;

        self.cache.write().remove(scope_key);
        info!("离线日志已清空: scope={}", scope_key);
        Ok(())
    }

    /// 丢弃日志（损坏或用户放弃离线修改）
    pub async fn discard(&self, scope_key: &str) -> Result<()> {
        let mut batch = KvBatch::new();
        batch.remove(self.journal_key(scope_key));
        batch.remove(self.cursor_key(scope_key));
        self.ns.apply_batch(batch).await?;
        self.maybe_flush().await?;
        self.cache.write().remove(scope_key);
        Ok(())
    }

    pub async fn replay_cursor(&self, scope_key: &str) -> Result<Option<u64>> {
        self.ns.get(self.cursor_key(scope_key)).await
    }

    /// 记录最后一次成功应用的 sequence
    pub async fn set_replay_cursor(&self, scope_key: &str, sequence: u64) -> Result<()> {
        self.ns.set(self.cursor_key(scope_key), &sequence).await?;
        self.maybe_flush().await?;
        self.cache
            .write()
            .entry(scope_key.to_string())
            .or_default()
            .replay_cursor = Some(sequence);
        Ok(())
    }

    /// 该 scope 分配过的最大 sequence
    pub async fn sequence_high_water(&self, scope_key: &str) -> Result<u64> {
        Ok(self.ns.get(self.seq_key(scope_key)).await?.unwrap_or(0))
    }

    /// 待同步数（来自写穿缓存，未 load 过的 scope 返回 0）
    pub fn pending_count(&self, scope_key: &str) -> usize {
        self.cache
            .read()
            .get(scope_key)
            .and_then(|c| c.journal.as_ref().map(|j| j.pending_count(c.replay_cursor)))
            .unwrap_or(0)
    }

    /// 待重放的操作快照（来自写穿缓存）
    pub fn pending_operations(&self, scope_key: &str) -> Vec<SyncOperation> {
        self.cache
            .read()
            .get(scope_key)
            .and_then(|c| {
                c.journal
                    .as_ref()
                    .map(|j| j.pending_after(c.replay_cursor).into_iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// 缓存中的日志
    pub fn cached(&self, scope_key: &str) -> Option<MutationJournal> {
        self.cache
            .read()
            .get(scope_key)
            .and_then(|c| c.journal.clone())
    }

    /// 所有存在日志的 scope
    pub async fn pending_scopes(&self) -> Result<Vec<String>> {
        let prefix = self.journal_prefix();
        let keys = self.ns.scan_prefix_keys(prefix.as_bytes()).await?;
        let mut scopes = Vec::new();
        for key in keys {
            let Ok(key) = String::from_utf8(key) else {
                continue;
            };
            let Some(scope) = key.strip_prefix(&prefix) else {
                continue;
            };
            if !scope.contains('#') {
                scopes.push(scope.to_string());
            }
        }
        Ok(scopes)
    }

    /// 测试与诊断：直接写入原始字节
    #[doc(hidden)]
    pub async fn write_raw(&self, scope_key: &str, bytes: Vec<u8>) -> Result<()> {
        self.ns.set_raw(self.journal_key(scope_key), bytes).await
    }
}
