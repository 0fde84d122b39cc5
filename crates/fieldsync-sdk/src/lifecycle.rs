//! 重连回调管理
//!
//! 网络从离线切换到在线时，统一触发各模块的补偿动作（例如重放离线日志）。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

/// 重连回调 Hook
///
/// 各模块通过实现此 trait 来响应"重新上线"
#[async_trait]
pub trait ReconnectHook: Send + Sync {
    /// 日志中使用的名字
    fn name(&self) -> &str {
        "anonymous"
    }

    /// 网络恢复在线时调用
    async fn on_online(&self) -> Result<()>;
}

/// Hook 注册表
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<(u64, Arc<dyn ReconnectHook>)>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    /// 注册 Hook，返回注销用的 id
    pub fn register(&self, hook: Arc<dyn ReconnectHook>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut hooks = self.hooks.write();
        info!("重连 Hook 已注册: {}，当前共 {} 个", hook.name(), hooks.len() + 1);
        hooks.push((id, hook));
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        before != hooks.len()
    }

    /// 通知所有 Hook：网络已恢复
    ///
    /// 按注册顺序逐个执行一次，某个 Hook 失败只记录日志，不重试，继续执行其他 Hook。
    /// 返回失败的 Hook 数量。
    pub async fn notify_online(&self) -> usize {
        let hooks: Vec<Arc<dyn ReconnectHook>> =
            self.hooks.read().iter().map(|(_, h)| h.clone()).collect();
        if hooks.is_empty() {
            return 0;
        }

        info!("通知 {} 个模块：网络已恢复在线", hooks.len());
        let mut failures = 0;
        for hook in hooks {
            if let Err(e) = hook.on_online().await {
                warn!("重连 Hook {} 执行失败: {}", hook.name(), e);
                failures += 1;
            }
        }

        if failures > 0 {
            warn!("{} 个重连 Hook 失败，等待下一次上线或手动重试", failures);
        }
        failures
    }
}
