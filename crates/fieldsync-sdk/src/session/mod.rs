//! 编辑会话模块
//!
//! - DirtyTracker: 草稿与快照比较
//! - EditorSession: 单个编辑页面的 加载 → 编辑 → 保存 → 重放 → 确认 流程

pub mod dirty_tracker;
pub mod editor;

pub use dirty_tracker::DirtyTracker;
pub use editor::{EditorConfig, EditorSession, SaveOutcome, SessionState, SyncStatusInfo};
