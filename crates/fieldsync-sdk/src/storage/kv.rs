//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 按功能隔离的命名空间（每个命名空间一棵 sled Tree）
//! - 单键原子写入
//! - 多键原子批量写入（`KvBatch`）
//! - 前缀扫描

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{FieldSyncError, Result};

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    /// 数据目录（临时库为 None）
    base_path: Option<PathBuf>,
    /// 主数据库实例
    db: Arc<Db>,
    /// 已打开的命名空间
    namespaces: RwLock<HashMap<String, KvNamespace>>,
}

impl KvStore {
    /// 在 `<base_path>/kv` 下打开 KV 存储
    pub async fn open(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| FieldSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 旧进程/旧实例可能刚释放文件锁，重试多次带退避
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(db) => {
                    tracing::debug!("KV 存储已打开: {}", kv_path.display());
                    return Ok(Self {
                        base_path: Some(base_path),
                        db: Arc::new(db),
                        namespaces: RwLock::new(HashMap::new()),
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tracing::warn!("KV 存储被占用，{}ms 后重试 (#{})", delay_ms, attempt + 1);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(FieldSyncError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    /// 打开临时 KV 存储（进程退出后删除，用于测试/演示）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| FieldSyncError::KvStore(format!("打开临时 sled 数据库失败: {}", e)))?;
        Ok(Self {
            base_path: None,
            db: Arc::new(db),
            namespaces: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// 获取（必要时创建）命名空间
    pub fn namespace(&self, name: &str) -> Result<KvNamespace> {
        if let Some(ns) = self.namespaces.read().get(name) {
            return Ok(ns.clone());
        }

        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| FieldSyncError::KvStore(format!("打开命名空间 {} 失败: {}", name, e)))?;
        let ns = KvNamespace {
            name: name.to_string(),
            tree,
        };
        self.namespaces
            .write()
            .entry(name.to_string())
            .or_insert_with(|| ns.clone());
        tracing::debug!("KV 命名空间已打开: {}", name);
        Ok(ns)
    }

    /// 删除整个命名空间
    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        self.namespaces.write().remove(name);
        self.db
            .drop_tree(name)
            .map_err(|e| FieldSyncError::KvStore(format!("删除命名空间 {} 失败: {}", name, e)))?;
        Ok(())
    }

    /// 将所有脏数据刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FieldSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 单个命名空间（一棵 sled Tree）
#[derive(Debug, Clone)]
pub struct KvNamespace {
    name: String,
    tree: Tree,
}

impl KvNamespace {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 设置键值对（值以 JSON 序列化）
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FieldSyncError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree
            .insert(key, value_bytes)
            .map_err(|e| FieldSyncError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        match self.get_raw(key).await? {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| FieldSyncError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 获取原始字节（由调用方自行解析）
    pub async fn get_raw<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| FieldSyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        Ok(result.map(|v| v.to_vec()))
    }

    /// 写入原始字节
    pub async fn set_raw<K>(&self, key: K, value: Vec<u8>) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .insert(key, value)
            .map_err(|e| FieldSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let result = self
            .tree
            .remove(key)
            .map_err(|e| FieldSyncError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.map(|v| v.to_vec()))
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let result = self
            .tree
            .contains_key(key)
            .map_err(|e| FieldSyncError::KvStore(format!("检查键存在失败: {}", e)))?;

        Ok(result)
    }

    /// 原子地应用一组写入/删除
    pub async fn apply_batch(&self, batch: KvBatch) -> Result<()> {
        self.tree
            .apply_batch(batch.inner)
            .map_err(|e| FieldSyncError::KvStore(format!("批量写入失败: {}", e)))?;
        Ok(())
    }

    /// 获取指定前缀的所有键（值不解析）
    pub async fn scan_prefix_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for result in self.tree.scan_prefix(prefix) {
            let (key, _) = result
                .map_err(|e| FieldSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();

        for result in self.tree.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| FieldSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| FieldSyncError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 将本命名空间刷盘
    pub async fn flush(&self) -> Result<()> {
        self.tree
            .flush_async()
            .await
            .map_err(|e| FieldSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// 原子批量写入
#[derive(Debug, Default)]
pub struct KvBatch {
    inner: sled::Batch,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<K, V>(&mut self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FieldSyncError::Serialization(format!("序列化值失败: {}", e)))?;
        self.inner.insert(key.as_ref(), value_bytes);
        Ok(())
    }

    pub fn remove<K>(&mut self, key: K)
    where
        K: AsRef<[u8]>,
    {
        self.inner.remove(key.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_namespace_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::open(temp_dir.path()).await.unwrap();
        let ns = store.namespace("equipment").unwrap();

        let test_data = json!({"name": "pump", "count": 3});
        ns.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = ns.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(ns.exists("test_key").await.unwrap());
        assert!(!ns.exists("non_existent_key").await.unwrap());

        ns.delete("test_key").await.unwrap();
        let deleted: Option<serde_json::Value> = ns.get("test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = KvStore::temporary().unwrap();
        let a = store.namespace("a").unwrap();
        let b = store.namespace("b").unwrap();

        a.set("k", &1u64).await.unwrap();
        assert_eq!(a.get::<_, u64>("k").await.unwrap(), Some(1));
        assert_eq!(b.get::<_, u64>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_is_applied_together() {
        let store = KvStore::temporary().unwrap();
        let ns = store.namespace("batch").unwrap();
        ns.set("old", &"gone").await.unwrap();

        let mut batch = KvBatch::new();
        batch.set("key1", &json!({"value": 1})).unwrap();
        batch.set("key2", &json!({"value": 2})).unwrap();
        batch.remove("old");
        ns.apply_batch(batch).await.unwrap();

        let results: Vec<(Vec<u8>, serde_json::Value)> = ns.scan_prefix(b"key").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(!ns.exists("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(temp_dir.path()).await.unwrap();
            let ns = store.namespace("persist").unwrap();
            ns.set("k", &"v").await.unwrap();
            store.flush().await.unwrap();
        }

        let store = KvStore::open(temp_dir.path()).await.unwrap();
        let ns = store.namespace("persist").unwrap();
        let value: Option<String> = ns.get("k").await.unwrap();
        assert_eq!(value.as_deref(), Some("v"));
    }
}
