//! 离线日志重放
//!
//! 按 sequence 顺序把日志应用到远端：
//! - 全部成功：清空日志
//! - 第一次失败：立即停止，日志原样保留，重放游标停在最后一条成功的操作上
//!
//! Reconciler 不做定时重试，只在切换到在线或用户手动重试时执行。

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::gateway::RemoteGateway;
use super::scope_lock::ScopeLocks;
use crate::error::{RemoteError, Result};
use crate::events::{event_builders, EventManager};
use crate::lifecycle::ReconnectHook;
use crate::storage::journal::PersistentJournal;
use crate::storage::queue::operation::SyncOperation;
use crate::storage::queue::retry_policy::FailureDisposition;

/// 一次重放的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 没有待重放的日志
    NothingPending,
    /// 全部应用，日志已清空
    Synced { applied: usize },
    /// 在某条操作上失败，日志保留
    Pending {
        error: RemoteError,
        pending_count: usize,
    },
}

impl ReconcileOutcome {
    pub fn is_synced(&self) -> bool {
        !matches!(self, ReconcileOutcome::Pending { .. })
    }

    pub fn pending_count(&self) -> usize {
        match self {
            ReconcileOutcome::Pending { pending_count, .. } => *pending_count,
            _ => 0,
        }
    }

    pub fn error(&self) -> Option<&RemoteError> {
        match self {
            ReconcileOutcome::Pending { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn disposition(&self) -> Option<FailureDisposition> {
        self.error().map(FailureDisposition::from_remote)
    }
}

/// 离线日志重放器
pub struct Reconciler {
    journal: Arc<PersistentJournal>,
    gateway: Arc<dyn RemoteGateway>,
    locks: ScopeLocks,
    events: Option<Arc<EventManager>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("feature", &self.journal.feature())
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        journal: Arc<PersistentJournal>,
        gateway: Arc<dyn RemoteGateway>,
        locks: ScopeLocks,
    ) -> Self {
        Self {
            journal,
            gateway,
            locks,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: crate::events::SyncEvent) {
        if let Some(events) = &self.events {
            events.emit(event).await;
        }
    }

    /// 重放一个 scope 的日志
    ///
    /// 远端失败以 `ReconcileOutcome::Pending` 返回；`Err` 只表示本地存储错误。
    pub async fn reconcile(&self, scope_key: &str) -> Result<ReconcileOutcome> {
        if self.locks.is_locked(scope_key) {
            debug!("scope 正在写日志或重放，等待: scope={}", scope_key);
        }
        let guard = self.locks.lock(scope_key).await;
        let result = self.drain(scope_key).await;
        drop(guard);

        // 没有其它持有者的 scope 锁随之回收
        self.locks.prune();
        result
    }

    /// 调用方已持有 scope 锁
    async fn drain(&self, scope_key: &str) -> Result<ReconcileOutcome> {
        let Some(journal) = self.journal.load_recovering(scope_key).await? else {
            debug!("没有待重放的离线日志: scope={}", scope_key);
            return Ok(ReconcileOutcome::NothingPending);
        };

        let replay_cursor = self.journal.replay_cursor(scope_key).await?;
        let pending: Vec<SyncOperation> = journal
            .pending_after(replay_cursor)
            .into_iter()
            .cloned()
            .collect();

        if pending.is_empty() {
            // 上次重放已全部成功但未来得及清空
            self.journal.clear(scope_key).await?;
            self.emit(event_builders::reconcile_succeeded(scope_key, 0)).await;
            return Ok(ReconcileOutcome::Synced { applied: 0 });
        }

        info!(
            "开始重放离线日志: scope={}, mode={:?}, pending={}, cursor={:?}",
            scope_key,
            journal.mode,
            pending.len(),
            replay_cursor
        );
        self.emit(event_builders::reconcile_started(scope_key, pending.len()))
            .await;

        for (index, op) in pending.iter().enumerate() {
            match self.gateway.write(op).await {
                Ok(()) => {
                    self.journal.set_replay_cursor(scope_key, op.sequence).await?;
                    debug!("已应用: scope={}, {}", scope_key, op.describe());
                }
                Err(error) => {
                    let pending_count = pending.len() - index;
                    warn!(
                        "重放失败，停止: scope={}, op={}, error={}, 剩余={}",
                        scope_key,
                        op.describe(),
                        error,
                        pending_count
                    );
                    self.emit(event_builders::reconcile_failed(scope_key, &error, pending_count))
                        .await;
                    return Ok(ReconcileOutcome::Pending {
                        error,
                        pending_count,
                    });
                }
            }
        }

        self.journal.clear(scope_key).await?;
        info!("离线日志重放完成: scope={}, applied={}", scope_key, pending.len());
        self.emit(event_builders::reconcile_succeeded(scope_key, pending.len()))
            .await;
        Ok(ReconcileOutcome::Synced {
            applied: pending.len(),
        })
    }

    /// 重放所有存在日志的 scope（各 scope 相互独立、并发执行）
    pub async fn reconcile_all(&self) -> Result<Vec<(String, ReconcileOutcome)>> {
        let scopes = self.journal.pending_scopes().await?;
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        info!("重放全部离线日志: {} 个 scope", scopes.len());

        let results = join_all(scopes.iter().map(|scope| self.reconcile(scope))).await;

        let mut outcomes = Vec::with_capacity(scopes.len());
        for (scope, result) in scopes.into_iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push((scope, outcome)),
                Err(e) => warn!("重放 scope {} 时本地存储出错: {}", scope, e),
            }
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl ReconnectHook for Reconciler {
    fn name(&self) -> &str {
        "reconciler"
    }

    async fn on_online(&self) -> Result<()> {
        let outcomes = self.reconcile_all().await?;
        let failed = outcomes.iter().filter(|(_, o)| !o.is_synced()).count();
        if failed > 0 {
            warn!("上线后仍有 {} 个 scope 待同步", failed);
        }
        Ok(())
    }
}
