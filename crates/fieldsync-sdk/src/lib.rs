//! FieldSync SDK - 离线优先的结构化数据编辑缓冲
//!
//! 本 SDK 为现场数据录入页面（设备清单、网络设备登记、控制柜配置等）提供：
//! - 📡 网络状态监控：全进程唯一的在线 / 离线状态，切换时触发重放
//! - 💾 离线日志：按 scope 持久化未同步的修改，重启后不丢失
//! - 🔁 有序重放：按 sequence 顺序应用到远端，部分失败可从断点继续
//! - ✏️ 编辑会话：草稿、未保存修改检测、保存策略和同步状态展示
//! - ⚙️ 事件系统：统一的事件广播、过滤和回调
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fieldsync_sdk::{
//!     EditorConfig, FieldSyncConfig, FieldSyncSdk, ManualConnectivityListener, MemoryGateway,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FieldSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .feature("equipment")
//!         .build();
//!
//!     let listener = Arc::new(ManualConnectivityListener::new(Some(false)));
//!     let sdk = FieldSyncSdk::initialize(config, Arc::new(MemoryGateway::new()), listener.clone()).await?;
//!
//!     let mut session = sdk
//!         .open_session(EditorConfig::snapshot("equipment", "equipment:site-42"))
//!         .await?;
//!     session.load().await?;
//!     session.edit_draft(|draft| draft["count"] = 5.into())?;
//!     session.save().await?;
//!     println!("{}: {} pending", session.connectivity_label(), session.pending_count());
//!
//!     // 网络恢复后自动重放
//!     listener.push(Some(true));
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod sdk;
pub mod session;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{FieldSyncError, LoadError, RemoteError, Result};
pub use events::{EventFilter, EventManager, EventStats, FilteredEventReceiver, SyncEvent};
pub use lifecycle::{HookRegistry, ReconnectHook};
pub use network::{
    ConnectivityEvent, ConnectivityListener, ConnectivityMonitor, ConnectivityState,
    ManualConnectivityListener, Subscription,
};
pub use sdk::{FieldSyncConfig, FieldSyncConfigBuilder, FieldSyncSdk};
pub use session::{DirtyTracker, EditorConfig, EditorSession, SaveOutcome, SessionState, SyncStatusInfo};
pub use storage::{
    FailureDisposition, JournalMode, KvStore, MutationJournal, MutationQueue, OperationKind,
    PersistentJournal, QueueStats, SyncOperation,
};
pub use sync::{MemoryGateway, ReconcileOutcome, Reconciler, RemoteGateway, ScopeLocks};
pub use utils::TimeFormatter;
pub use version::SDK_VERSION;
