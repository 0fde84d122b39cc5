use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// 重放失败后的处理方式
///
/// 没有定时重试：可重试的失败只在下一次上线或用户手动重试时再次重放。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureDisposition {
    /// 网络类错误 - 保留日志，下次上线时自动重放
    RetryOnReconnect,
    /// 远端拒绝 - 保留日志，需要用户修改或丢弃
    NeedsUserAction,
}

impl FailureDisposition {
    pub fn from_remote(error: &RemoteError) -> Self {
        match error {
            RemoteError::Transient(_) => FailureDisposition::RetryOnReconnect,
            RemoteError::Rejected { .. } => FailureDisposition::NeedsUserAction,
        }
    }

    /// 判断是否会自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureDisposition::RetryOnReconnect)
    }

    /// UI 提示文案
    pub fn hint(&self) -> &'static str {
        match self {
            FailureDisposition::RetryOnReconnect => "will retry when back online",
            FailureDisposition::NeedsUserAction => "needs attention: edit and save again, or discard",
        }
    }
}

impl From<&RemoteError> for FailureDisposition {
    fn from(error: &RemoteError) -> Self {
        FailureDisposition::from_remote(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_from_remote_error() {
        assert_eq!(
            FailureDisposition::from(&RemoteError::transient("timeout")),
            FailureDisposition::RetryOnReconnect
        );
        assert_eq!(
            FailureDisposition::from(&RemoteError::from_status(422, "invalid serial")),
            FailureDisposition::NeedsUserAction
        );
        assert!(FailureDisposition::from(&RemoteError::from_status(502, "bad gateway")).is_retryable());
    }

    #[test]
    fn test_hint_mentions_next_step() {
        assert!(FailureDisposition::NeedsUserAction.hint().contains("discard"));
        assert!(FailureDisposition::RetryOnReconnect.hint().contains("online"));
    }
}
