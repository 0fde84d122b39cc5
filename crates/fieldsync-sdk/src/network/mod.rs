use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::lifecycle::{HookRegistry, ReconnectHook};
use crate::utils::TimeFormatter;

mod manual;
pub use manual::ManualConnectivityListener;

/// 网络状态（不对外暴露中间态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    /// 平台信号转状态；信号不可用时按离线处理
    pub fn from_signal(signal: Option<bool>) -> Self {
        match signal {
            Some(true) => ConnectivityState::Online,
            Some(false) | None => ConnectivityState::Offline,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }

    /// UI 文案，与序列化名一致
    pub fn label(&self) -> &'static str {
        match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
    pub timestamp: i64,
}

/// 网络状态监听器 trait（由平台层实现，如 Android/iOS/桌面）
#[async_trait]
pub trait ConnectivityListener: Send + Sync + fmt::Debug {
    /// 获取当前网络信号；`None` 表示平台无法判断
    async fn current_status(&self) -> Option<bool>;

    /// 开始监听网络信号变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<Option<bool>>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

type TransitionHandler = Arc<dyn Fn(&ConnectivityEvent) + Send + Sync>;

enum Dispatch {
    Transition(ConnectivityEvent),
    Barrier(oneshot::Sender<()>),
}

struct MonitorInner {
    state: RwLock<ConnectivityState>,
    status_sender: broadcast::Sender<ConnectivityEvent>,
    handlers: RwLock<HashMap<u64, TransitionHandler>>,
    hooks: HookRegistry,
    next_id: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

impl MonitorInner {
    /// 状态切换；相同状态的重复信号被抑制，返回是否发生了切换
    fn transition(&self, next: ConnectivityState) -> bool {
        let previous = {
            let mut state = self.state.write();
            if *state == next {
                debug!("忽略重复的网络状态信号: {}", next);
                return false;
            }
            std::mem::replace(&mut *state, next)
        };

        info!("网络状态切换: {} -> {}", previous, next);
        let event = ConnectivityEvent {
            from: previous,
            to: next,
            timestamp: TimeFormatter::now_millis(),
        };

        let handlers: Vec<TransitionHandler> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(&event);
        }

        let _ = self.status_sender.send(event.clone());

        if self.dispatch_tx.send(Dispatch::Transition(event)).is_err() {
            warn!("网络状态分发任务已退出，跳过重连 Hook");
        }
        true
    }
}

/// 取消订阅句柄
pub struct Subscription {
    monitor: Weak<MonitorInner>,
    kind: SubscriptionKind,
}

enum SubscriptionKind {
    Handler(u64),
    Hook(u64),
}

impl Subscription {
    /// 移除对应的回调 / Hook；监视器已释放时为空操作
    pub fn unsubscribe(self) {
        let Some(inner) = self.monitor.upgrade() else {
            return;
        };
        match self.kind {
            SubscriptionKind::Handler(id) => {
                inner.handlers.write().remove(&id);
            }
            SubscriptionKind::Hook(id) => {
                inner.hooks.unregister(id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, id) = match self.kind {
            SubscriptionKind::Handler(id) => ("handler", id),
            SubscriptionKind::Hook(id) => ("hook", id),
        };
        f.debug_struct("Subscription")
            .field("kind", &kind)
            .field("id", &id)
            .finish()
    }
}

/// 网络监控管理器
///
/// 全进程唯一的网络状态持有者；切换到在线时按注册顺序触发重连 Hook。
pub struct ConnectivityMonitor {
    listener: Arc<dyn ConnectivityListener>,
    inner: Arc<MonitorInner>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("listener", &self.listener)
            .field("state", &self.current())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// 创建监视器并查询一次平台状态
    pub async fn new(listener: Arc<dyn ConnectivityListener>) -> Self {
        Self::with_events(listener, None).await
    }

    /// 创建监视器；状态切换同时转发到事件总线
    pub async fn with_events(
        listener: Arc<dyn ConnectivityListener>,
        events: Option<Arc<EventManager>>,
    ) -> Self {
        let initial = ConnectivityState::from_signal(listener.current_status().await);
        info!("初始网络状态: {}", initial);

        let (status_sender, _) = broadcast::channel(100);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(MonitorInner {
            state: RwLock::new(initial),
            status_sender,
            handlers: RwLock::new(HashMap::new()),
            hooks: HookRegistry::new(),
            next_id: AtomicU64::new(1),
            dispatch_tx,
        });

        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), dispatch_rx, events));

        Self {
            listener,
            inner,
            listen_task: Mutex::new(None),
        }
    }

    /// 启动平台信号监听任务
    pub async fn start(&self) {
        let mut receiver = match self.listener.start_monitoring().await {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("启动网络监听失败，按离线处理: {}", e);
                self.inner.transition(ConnectivityState::Offline);
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(signal) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.transition(ConnectivityState::from_signal(signal));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("网络信号积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if let Some(inner) = weak.upgrade() {
                            warn!("平台网络信号已关闭，按离线处理");
                            inner.transition(ConnectivityState::Offline);
                        }
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.listen_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// 停止监听
    pub async fn stop(&self) {
        let task = self.listen_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.listener.stop_monitoring().await;
        info!("网络监听已停止");
    }

    /// 获取当前网络状态
    pub fn current(&self) -> ConnectivityState {
        *self.inner.state.read()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// 处理一次平台信号（`None` 视为离线）
    pub fn apply_signal(&self, signal: Option<bool>) -> bool {
        self.inner.transition(ConnectivityState::from_signal(signal))
    }

    /// 手动设置网络状态（例如网关探测成功后）
    pub fn set_status(&self, state: ConnectivityState) -> bool {
        self.inner.transition(state)
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.status_sender.subscribe()
    }

    /// 注册状态切换回调；每次真实切换调用一次
    pub fn on_transition<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectivityEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.handlers.write().insert(id, Arc::new(handler));
        Subscription {
            monitor: Arc::downgrade(&self.inner),
            kind: SubscriptionKind::Handler(id),
        }
    }

    /// 注册重连 Hook；每次切换到在线时执行一次，失败不重试
    pub fn register_hook(&self, hook: Arc<dyn ReconnectHook>) -> Subscription {
        let id = self.inner.hooks.register(hook);
        Subscription {
            monitor: Arc::downgrade(&self.inner),
            kind: SubscriptionKind::Hook(id),
        }
    }

    pub fn hook_count(&self) -> usize {
        self.inner.hooks.hook_count()
    }

    /// 等待此前所有状态切换的 Hook 执行完毕
    pub async fn wait_idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.dispatch_tx.send(Dispatch::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.listen_task.lock().take() {
            task.abort();
        }
    }
}

/// 按切换顺序广播事件并执行重连 Hook
///
/// 运行在独立任务上，关闭页面不会中断已经开始的重放。
async fn dispatch_loop(
    inner: Weak<MonitorInner>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    events: Option<Arc<EventManager>>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Transition(event) => {
                if let Some(events) = &events {
                    events
                        .emit(event_builders::connectivity_changed(event.from, event.to))
                        .await;
                }
                if event.to.is_online() {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.hooks.notify_online().await;
                }
            }
            Dispatch::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("网络状态分发任务退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldSyncError;
    use std::sync::atomic::AtomicUsize;

    struct CountingHook(Arc<AtomicUsize>);

    #[async_trait]
    impl ReconnectHook for CountingHook {
        async fn on_online(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(FieldSyncError::InvalidState("still failing".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unknown_initial_status_is_offline() {
        let listener = Arc::new(ManualConnectivityListener::new(None));
        let monitor = ConnectivityMonitor::new(listener).await;
        assert_eq!(monitor.current(), ConnectivityState::Offline);
    }

    #[test]
    fn test_label_matches_serialized_name() {
        for state in [ConnectivityState::Online, ConnectivityState::Offline] {
            let serialized = serde_json::to_value(state).unwrap();
            assert_eq!(serialized.as_str(), Some(state.label()));
        }
        assert_eq!(ConnectivityState::Offline.to_string(), "offline");
    }

    #[tokio::test]
    async fn test_duplicate_signals_are_suppressed() {
        let listener = Arc::new(ManualConnectivityListener::new(Some(false)));
        let monitor = ConnectivityMonitor::new(listener).await;
        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        let subscription = monitor.on_transition(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(monitor.apply_signal(Some(true)));
        assert!(!monitor.apply_signal(Some(true)));
        assert!(monitor.apply_signal(None));
        assert!(!monitor.apply_signal(Some(false)));
        assert_eq!(transitions.load(Ordering::SeqCst), 2);

        subscription.unsubscribe();
        monitor.set_status(ConnectivityState::Online);
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hooks_run_once_per_online_transition() {
        let listener = Arc::new(ManualConnectivityListener::new(Some(false)));
        let monitor = ConnectivityMonitor::new(listener).await;
        let calls = Arc::new(AtomicUsize::new(0));
        monitor.register_hook(Arc::new(CountingHook(calls.clone())));

        monitor.set_status(ConnectivityState::Online);
        monitor.wait_idle().await;
        // 失败的 Hook 不会被重试
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        monitor.set_status(ConnectivityState::Offline);
        monitor.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        monitor.set_status(ConnectivityState::Online);
        monitor.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_listener_signals_drive_state() {
        let listener = Arc::new(ManualConnectivityListener::new(Some(false)));
        let monitor = ConnectivityMonitor::new(listener.clone()).await;
        let mut receiver = monitor.subscribe();
        monitor.start().await;

        listener.push(Some(true));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.from, ConnectivityState::Offline);
        assert_eq!(event.to, ConnectivityState::Online);
        assert!(monitor.is_online());

        monitor.stop().await;
        assert!(!listener.is_monitoring());
    }

    #[tokio::test]
    async fn test_transitions_reach_event_bus() {
        let events = Arc::new(EventManager::new(16));
        let mut receiver = events.subscribe();
        let listener = Arc::new(ManualConnectivityListener::new(Some(true)));
        let monitor = ConnectivityMonitor::with_events(listener, Some(events)).await;

        monitor.set_status(ConnectivityState::Offline);
        monitor.wait_idle().await;

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "connectivity_changed");
    }
}
