//! 快照存储后端
//!
//! 键按命名空间组织，例如 `task:<id>`。存储有容量上限，
//! 写入超出容量时返回 [`PersistenceError::QuotaExceeded`]，而且不会破坏已有数据。

use crate::error::PersistenceError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// 键值形式的快照存储
pub trait SnapshotStore: Send + Sync {
    /// 写入；超过容量返回 `QuotaExceeded`
    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;

    /// 读取；键不存在返回 None
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// 删除；键不存在不算错误
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;

    /// 列出指定前缀的所有键（已排序）
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;
}

/// 内存存储，用于测试和嵌入式调用
pub struct MemoryStore {
    capacity: usize,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 当前占用的字节数
    pub fn used_bytes(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, PersistenceError> {
        self.entries
            .lock()
            .map_err(|e| PersistenceError::Storage(format!("内存存储锁已损坏: {}", e)))
    }
}

impl SnapshotStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let mut entries = self.lock()?;
        let others: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, v)| v.len())
            .sum();
        if others + value.len() > self.capacity {
            return Err(PersistenceError::QuotaExceeded {
                key: key.to_string(),
                needed: value.len(),
                capacity: self.capacity.saturating_sub(others),
            });
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// 目录存储：每个键一个 JSON 文件
///
/// ```text
/// state-dir/
/// ├── task@3f2a….json   → task:3f2a…
/// └── task@9c01….json   → task:9c01…
/// ```
///
/// 写入先落到临时文件再重命名，写失败时旧快照保持不变。
pub struct FileStore {
    dir: PathBuf,
    capacity: usize,
}

const FILE_SUFFIX: &str = ".json";

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            PersistenceError::Storage(format!("无法创建状态目录 {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir, capacity })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", key.replace(':', "@"), FILE_SUFFIX))
    }

    fn key_for(file_name: &str) -> Option<String> {
        file_name
            .strip_suffix(FILE_SUFFIX)
            .map(|stem| stem.replace('@', ":"))
    }

    fn used_by_others(&self, key: &str) -> Result<usize, PersistenceError> {
        let target = self.path_for(key);
        let mut used = 0usize;
        for entry in fs::read_dir(&self.dir).map_err(storage_err)? {
            let path = entry.map_err(storage_err)?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(FILE_SUFFIX));
            if !is_snapshot || path == target {
                continue;
            }
            used += fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
        }
        Ok(used)
    }
}

fn storage_err(e: std::io::Error) -> PersistenceError {
    PersistenceError::Storage(e.to_string())
}

impl SnapshotStore for FileStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let others = self.used_by_others(key)?;
        if others + value.len() > self.capacity {
            return Err(PersistenceError::QuotaExceeded {
                key: key.to_string(),
                needed: value.len(),
                capacity: self.capacity.saturating_sub(others),
            });
        }

        let target = self.path_for(key);
        let temp = target.with_extension("tmp");
        fs::write(&temp, value).map_err(|e| {
            let _ = fs::remove_file(&temp);
            storage_err(e)
        })?;
        fs::rename(&temp, &target).map_err(|e| {
            let _ = fs::remove_file(&temp);
            storage_err(e)
        })?;
        debug!("快照已写入 {} ({} 字节)", target.display(), value.len());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(storage_err)? {
            let entry = entry.map_err(storage_err)?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(Self::key_for) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_quota() {
        let store = MemoryStore::new(10);
        store.put("task:a", b"123456").unwrap();
        let err = store.put("task:b", b"123456").unwrap_err();
        assert!(matches!(err, PersistenceError::QuotaExceeded { needed: 6, capacity: 4, .. }));
        // 覆盖同一个键不重复计算旧值
        store.put("task:a", b"1234567890").unwrap();
        assert_eq!(store.used_bytes(), 10);
        assert_eq!(store.list_keys("task:").unwrap(), vec!["task:a".to_string()]);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 1024).unwrap();
        store.put("task:abc", b"{\"v\":1}").unwrap();
        store.put("other:x", b"{}").unwrap();

        assert_eq!(store.get("task:abc").unwrap().unwrap(), b"{\"v\":1}");
        assert_eq!(store.list_keys("task:").unwrap(), vec!["task:abc".to_string()]);
        assert!(dir.path().join("task@abc.json").exists());

        store.remove("task:abc").unwrap();
        store.remove("task:abc").unwrap();
        assert!(store.get("task:abc").unwrap().is_none());
    }

    #[test]
    fn test_file_store_failed_put_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path(), 16).unwrap();
        store.put("task:a", b"old").unwrap();
        assert!(store.put("task:a", &[b'x'; 32]).is_err());
        assert_eq!(store.get("task:a").unwrap().unwrap(), b"old");
    }
}
