//! 统一 SDK 接口 - FieldSyncSdk 主入口
//!
//! 分层架构设计：
//! ```text
//! FieldSyncSdk
//!   ├── KvStore (sled 存储层)
//!   ├── PersistentJournal (离线日志层)
//!   ├── Reconciler (重放层，依赖宿主提供的 RemoteGateway)
//!   ├── ConnectivityMonitor (网络监控层，依赖平台提供的 ConnectivityListener)
//!   └── EventManager (事件系统层)
//! ```
//!
//! 初始化时 Reconciler 作为重连 Hook 注册到 ConnectivityMonitor，
//! 网络恢复时自动重放所有离线日志。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{FieldSyncError, Result};
use crate::events::EventManager;
use crate::network::{ConnectivityListener, ConnectivityMonitor, Subscription};
use crate::session::{EditorConfig, EditorSession};
use crate::storage::journal::{JournalMode, PersistentJournal};
use crate::storage::kv::KvStore;
use crate::storage::queue::MutationQueue;
use crate::sync::{ReconcileOutcome, Reconciler, RemoteGateway, ScopeLocks};
use crate::version;

/// FieldSync SDK 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSyncConfig {
    /// 数据存储目录（sled 数据库位于其下的 kv/）
    pub data_dir: PathBuf,
    /// 存储 key 前缀，区分不同功能的离线日志
    pub feature: String,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 每次写日志后是否立即 flush 到磁盘
    pub flush_on_write: bool,
    /// 初始化时如果在线，是否立即重放遗留的离线日志
    pub reconcile_on_start: bool,
}

impl Default for FieldSyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            feature: "fieldsync".to_string(),
            event_buffer_size: 256,
            flush_on_write: true,
            reconcile_on_start: true,
        }
    }
}

impl FieldSyncConfig {
    pub fn builder() -> FieldSyncConfigBuilder {
        FieldSyncConfigBuilder::new()
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.feature.trim().is_empty() {
            return Err(FieldSyncError::Config("feature must not be empty".to_string()));
        }
        if self.feature.contains('#') {
            return Err(FieldSyncError::Config(format!(
                "feature must not contain '#': {}",
                self.feature
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(FieldSyncError::Config(
                "event_buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 获取默认数据目录 ~/.fieldsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".fieldsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".fieldsync")
    } else {
        PathBuf::from("./fieldsync_data")
    }
}

/// FieldSync SDK 配置构建器
#[derive(Debug, Default)]
pub struct FieldSyncConfigBuilder {
    config: FieldSyncConfig,
}

impl FieldSyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn feature<S: Into<String>>(mut self, feature: S) -> Self {
        self.config.feature = feature.into();
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn flush_on_write(mut self, enabled: bool) -> Self {
        self.config.flush_on_write = enabled;
        self
    }

    pub fn reconcile_on_start(mut self, enabled: bool) -> Self {
        self.config.reconcile_on_start = enabled;
        self
    }

    pub fn build(self) -> FieldSyncConfig {
        self.config
    }
}

/// FieldSync SDK 主入口
pub struct FieldSyncSdk {
    config: FieldSyncConfig,
    kv: KvStore,
    journal: Arc<PersistentJournal>,
    locks: ScopeLocks,
    gateway: Arc<dyn RemoteGateway>,
    reconciler: Arc<Reconciler>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    reconnect_hook: Mutex<Option<Subscription>>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for FieldSyncSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSyncSdk")
            .field("config", &self.config)
            .field("connectivity", &self.monitor.current())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl FieldSyncSdk {
    /// 初始化 SDK
    ///
    /// `gateway` 为宿主的远端实现，`listener` 为平台网络状态来源。
    pub async fn initialize(
        config: FieldSyncConfig,
        gateway: Arc<dyn RemoteGateway>,
        listener: Arc<dyn ConnectivityListener>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 {}", version::version_line());
        config.validate()?;

        // === 第1层：存储 ===
        let kv = KvStore::open(&config.data_dir).await?;

        // === 第2层：事件管理器 ===
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第3层：离线日志与重放 ===
        let journal = Arc::new(
            PersistentJournal::new(&kv, config.feature.clone(), config.flush_on_write)?
                .with_events(events.clone()),
        );
        let locks = ScopeLocks::new();
        let reconciler = Arc::new(
            Reconciler::new(journal.clone(), gateway.clone(), locks.clone())
                .with_events(events.clone()),
        );

        // === 第4层：网络监控 ===
        let monitor = Arc::new(ConnectivityMonitor::with_events(listener, Some(events.clone())).await);
        let reconnect_hook = monitor.register_hook(reconciler.clone());
        monitor.start().await;

        let sdk = Arc::new(Self {
            config,
            kv,
            journal,
            locks,
            gateway,
            reconciler,
            monitor,
            events,
            reconnect_hook: Mutex::new(Some(reconnect_hook)),
            initialized: AtomicBool::new(true),
        });

        if sdk.config.reconcile_on_start && sdk.monitor.is_online() {
            match sdk.reconciler.reconcile_all().await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    info!("启动时重放了 {} 个 scope 的离线日志", outcomes.len());
                }
                Ok(_) => {}
                Err(e) => warn!("启动时重放离线日志失败: {}", e),
            }
        }

        info!("FieldSyncSdk 初始化完成: data_dir={}", sdk.config.data_dir.display());
        Ok(sdk)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(FieldSyncError::InvalidState("SDK has been shut down".to_string()));
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &FieldSyncConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn journal(&self) -> &Arc<PersistentJournal> {
        &self.journal
    }

    /// 打开某个 scope 的离线变更队列
    pub async fn open_queue(&self, scope_key: &str, mode: JournalMode) -> Result<MutationQueue> {
        self.ensure_initialized()?;
        Ok(
            MutationQueue::open(self.journal.clone(), self.locks.clone(), scope_key, mode)
                .await?
                .with_events(self.events.clone()),
        )
    }

    /// 为一个编辑页面创建会话（调用方随后执行 `load()`）
    pub async fn open_session(&self, config: EditorConfig) -> Result<EditorSession> {
        let queue = self.open_queue(&config.scope_key, config.mode).await?;
        Ok(EditorSession::new(
            config,
            self.gateway.clone(),
            self.monitor.clone(),
            queue,
            self.reconciler.clone(),
            Some(self.events.clone()),
        ))
    }

    /// 手动重放某个 scope
    pub async fn reconcile(&self, scope_key: &str) -> Result<ReconcileOutcome> {
        self.ensure_initialized()?;
        self.reconciler.reconcile(scope_key).await
    }

    /// 重放所有 scope
    pub async fn reconcile_all(&self) -> Result<Vec<(String, ReconcileOutcome)>> {
        self.ensure_initialized()?;
        self.reconciler.reconcile_all().await
    }

    pub async fn pending_scopes(&self) -> Result<Vec<String>> {
        self.journal.pending_scopes().await
    }

    /// 关闭 SDK：注销重连 Hook、停止网络监听、刷盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 FieldSyncSdk...");
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(hook) = self.reconnect_hook.lock().take() {
            hook.unsubscribe();
        }
        self.monitor.stop().await;
        self.kv.flush().await?;

        info!("FieldSyncSdk 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManualConnectivityListener;
    use crate::sync::MemoryGateway;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults_and_builder() {
        let config = FieldSyncConfig::default();
        assert_eq!(config.feature, "fieldsync");
        assert_eq!(config.event_buffer_size, 256);
        assert!(config.flush_on_write);
        assert!(config.reconcile_on_start);

        let config = FieldSyncConfig::builder()
            .data_dir("/tmp/fieldsync-test")
            .feature("equipment")
            .event_buffer_size(8)
            .flush_on_write(false)
            .reconcile_on_start(false)
            .build();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/fieldsync-test"));
        assert_eq!(config.feature, "equipment");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = FieldSyncConfig::builder().feature("").build();
        assert!(matches!(config.validate(), Err(FieldSyncError::Config(_))));

        let config = FieldSyncConfig::builder().event_buffer_size(0).build();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_initialize_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = FieldSyncConfig::builder().data_dir(dir.path()).build();
        let sdk = FieldSyncSdk::initialize(
            config,
            Arc::new(MemoryGateway::new()),
            Arc::new(ManualConnectivityListener::new(Some(true))),
        )
        .await
        .unwrap();

        assert!(sdk.is_initialized());
        assert_eq!(sdk.monitor().hook_count(), 1);

        sdk.shutdown().await.unwrap();
        assert!(!sdk.is_initialized());
        assert_eq!(sdk.monitor().hook_count(), 0);
        assert!(sdk.open_queue("devices:site-1", JournalMode::Log).await.is_err());
    }
}
