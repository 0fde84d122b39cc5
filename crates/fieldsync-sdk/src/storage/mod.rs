//! 存储模块 - 离线变更的持久化层
//!
//! 分层：
//! - KvStore: sled 键值存储，按命名空间划分
//! - PersistentJournal: 每个 scope 一份离线日志，带写穿缓存
//! - MutationQueue: 单个 scope 的追加 / 查询句柄

pub mod journal;
pub mod kv;
pub mod queue;

// 重新导出核心类型
pub use journal::{JournalMode, MutationJournal, PersistentJournal};
pub use kv::{KvBatch, KvNamespace, KvStore};
pub use queue::{FailureDisposition, MutationQueue, OperationKind, QueueStats, SyncOperation};
