//! 事件系统模块 - 广播离线同步相关事件
//!
//! 功能包括：
//! - 网络状态切换事件
//! - 离线缓冲写入事件
//! - 重放开始 / 成功 / 失败事件
//! - 损坏日志丢弃事件
//! - 事件广播、过滤订阅、监听器回调和统计

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::network::ConnectivityState;
use crate::storage::queue::operation::OperationKind;
use crate::storage::queue::retry_policy::FailureDisposition;

/// SDK 事件类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 网络状态变更
    ConnectivityChanged {
        from: ConnectivityState,
        to: ConnectivityState,
        timestamp: i64,
    },
    /// 一条操作已写入离线日志
    OperationBuffered {
        scope_key: String,
        sequence: u64,
        kind: OperationKind,
        pending_count: usize,
        timestamp: i64,
    },
    /// 开始重放某个 scope
    ReconcileStarted {
        scope_key: String,
        pending_count: usize,
        timestamp: i64,
    },
    /// 日志已全部应用并清空
    ReconcileSucceeded {
        scope_key: String,
        applied: usize,
        timestamp: i64,
    },
    /// 重放在某条操作上失败，日志保留
    ReconcileFailed {
        scope_key: String,
        error: RemoteError,
        disposition: FailureDisposition,
        pending_count: usize,
        timestamp: i64,
    },
    /// 损坏或被用户放弃的日志已丢弃
    JournalDiscarded {
        scope_key: String,
        reason: String,
        timestamp: i64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::OperationBuffered { .. } => "operation_buffered",
            SyncEvent::ReconcileStarted { .. } => "reconcile_started",
            SyncEvent::ReconcileSucceeded { .. } => "reconcile_succeeded",
            SyncEvent::ReconcileFailed { .. } => "reconcile_failed",
            SyncEvent::JournalDiscarded { .. } => "journal_discarded",
        }
    }

    /// 获取事件关联的 scope
    pub fn scope_key(&self) -> Option<&str> {
        match self {
            SyncEvent::ConnectivityChanged { .. } => None,
            SyncEvent::OperationBuffered { scope_key, .. }
            | SyncEvent::ReconcileStarted { scope_key, .. }
            | SyncEvent::ReconcileSucceeded { scope_key, .. }
            | SyncEvent::ReconcileFailed { scope_key, .. }
            | SyncEvent::JournalDiscarded { scope_key, .. } => Some(scope_key),
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::OperationBuffered { timestamp, .. }
            | SyncEvent::ReconcileStarted { timestamp, .. }
            | SyncEvent::ReconcileSucceeded { timestamp, .. }
            | SyncEvent::ReconcileFailed { timestamp, .. }
            | SyncEvent::JournalDiscarded { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// scope 过滤器
    pub scope_keys: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_scope_keys(mut self, scope_keys: Vec<String>) -> Self {
        self.scope_keys = Some(scope_keys);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref scope_keys) = self.scope_keys {
            match event.scope_key() {
                Some(scope) => {
                    if !scope_keys.iter().any(|s| s == scope) {
                        return false;
                    }
                }
                // 事件没有 scope 但过滤器要求有
                None => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    /// 事件类型 -> 监听器；"*" 为通用监听器
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
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
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
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

    /// 添加事件监听器（event_type 为 "*" 时接收全部事件）
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
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

    /// 尝试接收事件（非阻塞）
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
    use crate::utils::TimeFormatter;

    pub fn connectivity_changed(from: ConnectivityState, to: ConnectivityState) -> SyncEvent {
        SyncEvent::ConnectivityChanged {
            from,
            to,
            timestamp: TimeFormatter::now_millis(),
        }
    }

    pub fn operation_buffered(
        scope_key: &str,
        sequence: u64,
        kind: OperationKind,
        pending_count: usize,
    ) -> SyncEvent {
        SyncEvent::OperationBuffered {
            scope_key: scope_key.to_string(),
            sequence,
            kind,
            pending_count,
            timestamp: TimeFormatter::now_millis(),
        }
    }

    pub fn reconcile_started(scope_key: &str, pending_count: usize) -> SyncEvent {
        SyncEvent::ReconcileStarted {
            scope_key: scope_key.to_string(),
            pending_count,
            timestamp: TimeFormatter::now_millis(),
        }
    }

    pub fn reconcile_succeeded(scope_key: &str, applied: usize) -> SyncEvent {
        SyncEvent::ReconcileSucceeded {
            scope_key: scope_key.to_string(),
            applied,
            timestamp: TimeFormatter::now_millis(),
        }
    }

    pub fn reconcile_failed(scope_key: &str, error: &RemoteError, pending_count: usize) -> SyncEvent {
        SyncEvent::ReconcileFailed {
            scope_key: scope_key.to_string(),
            error: error.clone(),
            disposition: FailureDisposition::from_remote(error),
            pending_count,
            timestamp: TimeFormatter::now_millis(),
        }
    }

    pub fn journal_discarded(scope_key: &str, reason: &str) -> SyncEvent {
        SyncEvent::JournalDiscarded {
            scope_key: scope_key.to_string(),
            reason: reason.to_string(),
            timestamp: TimeFormatter::now_millis(),
        }
    }
}
