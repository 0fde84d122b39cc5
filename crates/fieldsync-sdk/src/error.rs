use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 远端写入/读取失败
///
/// 这是唯一以类型化失败交给 EditorSession 调用方的错误类别：
/// UI 据此区分"会自动重试"和"需要用户处理"。
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteError {
    /// 网络异常、超时等 - 保留日志，下次上线时自动重放
    #[error("Transient remote error: {0}")]
    Transient(String),
    /// 校验失败、冲突等 - 保留日志，需要用户修改后重新保存或丢弃
    #[error("Remote rejected operation: {reason}")]
    Rejected {
        reason: String,
        status: Option<u16>,
    },
}

impl RemoteError {
    pub fn transient(reason: impl Into<String>) -> Self {
        RemoteError::Transient(reason.into())
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        RemoteError::Rejected {
            reason: reason.into(),
            status: None,
        }
    }

    /// 按 HTTP 风格状态码分类
    ///
    /// 408 / 429 / 5xx 视为瞬时错误，其余 4xx 视为被拒绝。
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
            500..=599 => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
            _ => RemoteError::Rejected {
                reason: message,
                status: Some(status),
            },
        }
    }

    /// 是否会在下次上线时自动重试
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// 远端读取失败且没有可用的离线日志
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Load failed for {collection} ({scope_key}): {source}")]
pub struct LoadError {
    pub collection: String,
    pub scope_key: String,
    #[source]
    pub source: RemoteError,
}

#[derive(Debug, Error)]
pub enum FieldSyncError {
    /// 本地日志无法解析 - 由调用方丢弃并记录日志
    #[error("Storage corrupt for scope {scope_key}: {reason}")]
    StorageCorrupt { scope_key: String, reason: String },

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 后台任务异常退出（panic 或运行时关闭）
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<sled::Error> for FieldSyncError {
    fn from(error: sled::Error) -> Self {
        FieldSyncError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for FieldSyncError {
    fn from(error: serde_json::Error) -> Self {
        FieldSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FieldSyncError {
    fn from(error: std::io::Error) -> Self {
        FieldSyncError::IO(error.to_string())
    }
}

impl From<tokio::task::JoinError> for FieldSyncError {
    fn from(error: tokio::task::JoinError) -> Self {
        FieldSyncError::Runtime(error.to_string())
    }
}

impl FieldSyncError {
    /// 获取远端错误（如果这是一个远端错误）
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            FieldSyncError::Remote(e) => Some(e),
            FieldSyncError::Load(e) => Some(&e.source),
            _ => None,
        }
    }

    pub fn is_storage_corrupt(&self) -> bool {
        matches!(self, FieldSyncError::StorageCorrupt { .. })
    }
}

pub type Result<T> = std::result::Result<T, FieldSyncError>;
