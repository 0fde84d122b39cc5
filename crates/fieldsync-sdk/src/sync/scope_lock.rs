use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 按 scope 串行化的异步锁
///
/// MutationQueue 的追加和 Reconciler 的重放共用同一把锁，
/// 同一 scope 的写日志与重放不会交错；不同 scope 互不阻塞。
#[derive(Debug, Clone, Default)]
pub struct ScopeLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, scope_key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(scope_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// 获取 scope 锁，持有期间其它追加 / 重放等待
    pub async fn lock(&self, scope_key: &str) -> OwnedMutexGuard<()> {
        self.entry(scope_key).lock_owned().await
    }

    /// scope 当前是否被占用
    pub fn is_locked(&self, scope_key: &str) -> bool {
        match self.locks.lock().get(scope_key) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// 清理没有人持有的锁
    pub fn prune(&self) {
        self.locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_scope_is_serialised() {
        let locks = ScopeLocks::new();
        let guard = locks.lock("devices:site-9").await;
        assert!(locks.is_locked("devices:site-9"));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("devices:site-9").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_scopes_do_not_block() {
        let locks = ScopeLocks::new();
        let _a = locks.lock("equipment:site-1").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock("equipment:site-2"))
            .await
            .unwrap();
        assert!(!locks.is_locked("equipment:site-3"));
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = ScopeLocks::new();
        let held = locks.lock("a").await;
        drop(locks.lock("b").await);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
