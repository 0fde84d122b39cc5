use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use super::ConnectivityListener;
use crate::error::Result;

/// 由宿主手动推送信号的监听器
///
/// 适用于宿主自己持有网络回调的场景，也用于测试。
#[derive(Debug)]
pub struct ManualConnectivityListener {
    status: RwLock<Option<bool>>,
    sender: broadcast::Sender<Option<bool>>,
    monitoring: AtomicBool,
}

impl ManualConnectivityListener {
    pub fn new(initial: Option<bool>) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: RwLock::new(initial),
            sender,
            monitoring: AtomicBool::new(false),
        }
    }

    /// 推送一次平台信号
    pub fn push(&self, signal: Option<bool>) {
        *self.status.write() = signal;
        // 未启动监听时没有接收者
        let _ = self.sender.send(signal);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }
}

impl Default for ManualConnectivityListener {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ConnectivityListener for ManualConnectivityListener {
    async fn current_status(&self) -> Option<bool> {
        *self.status.read()
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<Option<bool>>> {
        self.monitoring.store(true, Ordering::SeqCst);
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_updates_status_and_subscribers() {
        let listener = ManualConnectivityListener::new(Some(false));
        let mut receiver = tokio_test::block_on(listener.start_monitoring()).unwrap();
        assert!(listener.is_monitoring());

        listener.push(None);
        assert_eq!(tokio_test::block_on(listener.current_status()), None);
        assert_eq!(receiver.try_recv().unwrap(), None);

        tokio_test::block_on(listener.stop_monitoring());
        assert!(!listener.is_monitoring());
    }
}
