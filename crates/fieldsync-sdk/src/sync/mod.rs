//! 离线日志同步模块
//!
//! 职责：
//! - 定义远端网关接口（RemoteGateway）
//! - 按 scope 串行化日志追加与重放（ScopeLocks）
//! - 按 sequence 顺序重放离线日志（Reconciler）

pub mod gateway;
pub mod reconciler;
pub mod scope_lock;

pub use gateway::{MemoryGateway, RemoteGateway, RemoteResult};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use scope_lock::ScopeLocks;
