use std::fmt::Debug;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::storage::journal::{validate_scope_key, JournalMode, MutationJournal, PersistentJournal};
use crate::sync::ScopeLocks;

pub mod operation;
pub mod retry_policy;

// 重新导出核心类型
pub use operation::{OperationKind, SyncOperation};
pub use retry_policy::FailureDisposition;

/// 队列统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub scope_key: String,
    pub mode: JournalMode,
    pub pending_count: usize,
    /// 本 scope 最后分配的 sequence
    pub last_sequence: u64,
    /// 最早一条待重放操作的缓冲时间（UTC 毫秒）
    pub oldest_pending_at: Option<i64>,
}

/// 单个 scope 的离线变更队列
///
/// 不持有数据副本，所有状态都在 PersistentJournal 中；追加与 Reconciler 共用 scope 锁。
#[derive(Clone)]
pub struct MutationQueue {
    journal: Arc<PersistentJournal>,
    locks: ScopeLocks,
    scope_key: String,
    mode: JournalMode,
    events: Option<Arc<EventManager>>,
}

impl Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("scope_key", &self.scope_key)
            .field("mode", &self.mode)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl MutationQueue {
    /// 打开队列并加载已有日志，重启后 pending 数立即可用
    ///
    /// 已存储日志的模式与请求的不同时，以已存储的为准。
    pub async fn open(
        journal: Arc<PersistentJournal>,
        locks: ScopeLocks,
        scope_key: impl Into<String>,
        mode: JournalMode,
    ) -> Result<Self> {
        let scope_key = scope_key.into();
        validate_scope_key(&scope_key)?;

        let mode = match journal.load_recovering(&scope_key).await? {
            Some(stored) if stored.mode != mode => {
                warn!(
                    "已存储日志模式与请求不同，沿用已存储模式: scope={}, stored={:?}, requested={:?}",
                    scope_key, stored.mode, mode
                );
                stored.mode
            }
            Some(stored) => {
                info!(
                    "发现未同步的离线日志: scope={}, pending={}",
                    scope_key,
                    journal.pending_count(&scope_key)
                );
                stored.mode
            }
            None => mode,
        };

        Ok(Self {
            journal,
            locks,
            scope_key,
            mode,
            events: None,
        })
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn mode(&self) -> JournalMode {
        self.mode
    }

    /// 追加一条操作并立即持久化，返回分配的 sequence
    ///
    /// snapshot 模式替换已缓冲的操作；log 模式保留之前的操作。
    pub async fn append(&self, op: SyncOperation) -> Result<u64> {
        op.validate()?;
        let kind = op.kind;

        let pending_count;
        let sequence;
        {
            let _guard = self.locks.lock(&self.scope_key).await;

            // 锁内重新读取：Reconciler 可能刚清空了日志
            let mut journal = match self.journal.load_recovering(&self.scope_key).await? {
                Some(journal) => journal,
                None => {
                    let floor = self.journal.sequence_high_water(&self.scope_key).await?;
                    MutationJournal::new(self.scope_key.clone(), self.mode, floor)
                }
            };

            sequence = journal.push(op);
            self.journal.save(&journal).await?;
            pending_count = self.journal.pending_count(&self.scope_key);
        }

        info!(
            "操作已写入离线日志: scope={}, sequence={}, kind={}, pending={}",
            self.scope_key, sequence, kind, pending_count
        );
        if let Some(events) = &self.events {
            events
                .emit(event_builders::operation_buffered(
                    &self.scope_key,
                    sequence,
                    kind,
                    pending_count,
                ))
                .await;
        }
        Ok(sequence)
    }

    /// 从存储重新读取日志（损坏的日志会被丢弃），返回待同步数
    pub async fn reload(&self) -> Result<usize> {
        self.journal.load_recovering(&self.scope_key).await?;
        Ok(self.pending_count())
    }

    /// 待同步数（snapshot 模式 0/1，log 模式 0..N）
    pub fn pending_count(&self) -> usize {
        self.journal.pending_count(&self.scope_key)
    }

    /// 待重放的操作（按 sequence 顺序）
    pub fn pending_operations(&self) -> Vec<SyncOperation> {
        self.journal.pending_operations(&self.scope_key)
    }

    pub fn stats(&self) -> QueueStats {
        let pending = self.pending_operations();
        QueueStats {
            scope_key: self.scope_key.clone(),
            mode: self.mode,
            pending_count: pending.len(),
            last_sequence: self
                .journal
                .cached(&self.scope_key)
                .map(|j| j.sequence_cursor)
                .unwrap_or(0),
            oldest_pending_at: pending.iter().map(|op| op.created_at).min(),
        }
    }

    /// 用户放弃离线修改（例如被远端拒绝后）
    pub async fn discard(&self) -> Result<()> {
        let _guard = self.locks.lock(&self.scope_key).await;
        self.journal.discard(&self.scope_key).await?;
        info!("离线修改已被用户丢弃: scope={}", self.scope_key);
        if let Some(events) = &self.events {
            events
                .emit(event_builders::journal_discarded(
                    &self.scope_key,
                    "discarded by user",
                ))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::KvStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn journal_on(kv: &KvStore) -> Arc<PersistentJournal> {
        Arc::new(PersistentJournal::new(kv, "test", true).unwrap())
    }

    #[tokio::test]
    async fn test_snapshot_mode_coalesces() {
        let kv = KvStore::temporary().unwrap();
        let queue = MutationQueue::open(
            journal_on(&kv),
            ScopeLocks::new(),
            "equipment:site-42",
            JournalMode::Snapshot,
        )
        .await
        .unwrap();

        for count in 1..=5 {
            queue
                .append(SyncOperation::upsert(
                    "equipment",
                    Some("equipment:site-42".to_string()),
                    json!({"count": count}),
                ))
                .await
                .unwrap();
        }

        assert_eq!(queue.pending_count(), 1);
        let pending = queue.pending_operations();
        assert_eq!(pending[0].payload, Some(json!({"count": 5})));
        assert_eq!(pending[0].sequence, 5);
    }

    #[tokio::test]
    async fn test_log_mode_preserves_order() {
        let kv = KvStore::temporary().unwrap();
        let queue = MutationQueue::open(
            journal_on(&kv),
            ScopeLocks::new(),
            "devices:site-9",
            JournalMode::Log,
        )
        .await
        .unwrap();

        queue
            .append(SyncOperation::insert("devices", json!({"id": "NET-7"})))
            .await
            .unwrap();
        queue
            .append(SyncOperation::update("devices", "NET-7", json!({"port": 3})))
            .await
            .unwrap();
        queue.append(SyncOperation::delete("devices", "NET-7")).await.unwrap();

        let kinds: Vec<OperationKind> = queue.pending_operations().iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OperationKind::Insert, OperationKind::Update, OperationKind::Delete]
        );
        let stats = queue.stats();
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.last_sequence, 3);
        assert!(stats.oldest_pending_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let kv = KvStore::open(dir.path()).await.unwrap();
            let queue = MutationQueue::open(
                journal_on(&kv),
                ScopeLocks::new(),
                "devices:site-9",
                JournalMode::Log,
            )
            .await
            .unwrap();
            queue
                .append(SyncOperation::insert("devices", json!({"id": "NET-1"})))
                .await
                .unwrap();
            queue
                .append(SyncOperation::insert("devices", json!({"id": "NET-2"})))
                .await
                .unwrap();
            kv.flush().await.unwrap();
        }

        let kv = KvStore::open(dir.path()).await.unwrap();
        let queue = MutationQueue::open(
            journal_on(&kv),
            ScopeLocks::new(),
            "devices:site-9",
            JournalMode::Log,
        )
        .await
        .unwrap();
        assert_eq!(queue.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_stored_mode_wins() {
        let kv = KvStore::temporary().unwrap();
        let journal = journal_on(&kv);
        let locks = ScopeLocks::new();
        let queue = MutationQueue::open(journal.clone(), locks.clone(), "s", JournalMode::Log)
            .await
            .unwrap();
        queue
            .append(SyncOperation::insert("devices", json!({})))
            .await
            .unwrap();

        let reopened = MutationQueue::open(journal, locks, "s", JournalMode::Snapshot)
            .await
            .unwrap();
        assert_eq!(reopened.mode(), JournalMode::Log);
    }

    #[tokio::test]
    async fn test_sequences_are_not_reused_after_discard() {
        let kv = KvStore::temporary().unwrap();
        let queue = MutationQueue::open(
            journal_on(&kv),
            ScopeLocks::new(),
            "devices:site-9",
            JournalMode::Log,
        )
        .await
        .unwrap();
        queue
            .append(SyncOperation::insert("devices", json!({})))
            .await
            .unwrap();
        queue.discard().await.unwrap();
        assert_eq!(queue.pending_count(), 0);

        let sequence = queue
            .append(SyncOperation::insert("devices", json!({})))
            .await
            .unwrap();
        assert_eq!(sequence, 2);
    }

    #[tokio::test]
    async fn test_invalid_operation_is_rejected_before_storage() {
        let kv = KvStore::temporary().unwrap();
        let queue = MutationQueue::open(
            journal_on(&kv),
            ScopeLocks::new(),
            "devices:site-9",
            JournalMode::Log,
        )
        .await
        .unwrap();
        let mut op = SyncOperation::delete("devices", "NET-1");
        op.record_id = None;

        assert!(queue.append(op).await.is_err());
        assert_eq!(queue.pending_count(), 0);
    }
}
