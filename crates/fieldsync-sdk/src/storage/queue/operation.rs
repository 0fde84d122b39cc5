use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::error::{FieldSyncError, Result};
use crate::utils::TimeFormatter;

/// 操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Upsert => "upsert",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次缓冲的远端写入意图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// 操作幂等键，构建时生成；网关可据此对同一操作的重放去重
    pub op_id: Uuid,
    pub kind: OperationKind,
    /// 逻辑集合名
    pub collection: String,
    /// 目标记录 ID（insert 时为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// 不透明 JSON（delete 时为空）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// 追加时分配的序号，决定重放顺序；0 表示尚未分配
    #[serde(default)]
    pub sequence: u64,
    /// 缓冲时间（UTC 毫秒），仅用于诊断，不参与排序
    pub created_at: i64,
}

impl SyncOperation {
    fn build(
        kind: OperationKind,
        collection: impl Into<String>,
        record_id: Option<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            kind,
            collection: collection.into(),
            record_id,
            payload,
            sequence: 0,
            created_at: TimeFormatter::now_millis(),
        }
    }

    pub fn insert(collection: impl Into<String>, payload: Value) -> Self {
        Self::build(OperationKind::Insert, collection, None, Some(payload))
    }

    pub fn update(collection: impl Into<String>, record_id: impl Into<String>, payload: Value) -> Self {
        Self::build(
            OperationKind::Update,
            collection,
            Some(record_id.into()),
            Some(payload),
        )
    }

    pub fn delete(collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::build(OperationKind::Delete, collection, Some(record_id.into()), None)
    }

    /// upsert 的 record_id 可选：整份快照写入时由网关按 scope 定位
    pub fn upsert(collection: impl Into<String>, record_id: Option<String>, payload: Value) -> Self {
        Self::build(OperationKind::Upsert, collection, record_id, Some(payload))
    }

    /// 校验字段组合是否合法
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(FieldSyncError::InvalidOperation(
                "collection must not be empty".to_string(),
            ));
        }
        match self.kind {
            OperationKind::Insert if self.record_id.is_some() => Err(FieldSyncError::InvalidOperation(
                "insert must not carry a record id".to_string(),
            )),
            OperationKind::Update | OperationKind::Delete if self.record_id.is_none() => {
                Err(FieldSyncError::InvalidOperation(format!(
                    "{} requires a record id",
                    self.kind
                )))
            }
            OperationKind::Delete if self.payload.is_some() => Err(FieldSyncError::InvalidOperation(
                "delete must not carry a payload".to_string(),
            )),
            OperationKind::Insert | OperationKind::Update | OperationKind::Upsert
                if self.payload.is_none() =>
            {
                Err(FieldSyncError::InvalidOperation(format!(
                    "{} requires a payload",
                    self.kind
                )))
            }
            _ => Ok(()),
        }
    }

    /// 日志用短描述
    pub fn describe(&self) -> String {
        match &self.record_id {
            Some(id) => format!("#{} {} {}/{}", self.sequence, self.kind, self.collection, id),
            None => format!("#{} {} {}", self.sequence, self.kind, self.collection),
        }
    }
}
