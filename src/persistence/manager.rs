//! 持久化管理
//!
//! 保存是尽力而为的：任何存储问题都只记录警告并返回 `false`，绝不让流水线失败。
//! 写入前先估算体积，超出预算时依次降档：
//! 1. 淘汰其他任务中超过 TTL 的旧快照，再试完整快照
//! 2. 去掉图片字节
//! 3. 只保留 id 与状态
//!
//! 最小快照仍然写不进去时，清空所有任务快照再重试一次。

use crate::config::Config;
use crate::error::PersistenceError;
use crate::models::Task;
use crate::persistence::snapshot::{Snapshot, SnapshotHeader, SnapshotTier};
use crate::persistence::store::SnapshotStore;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 快照键前缀
pub const KEY_PREFIX: &str = "task:";

pub fn snapshot_key(task_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, task_id)
}

#[derive(Debug, Default)]
struct SaveState {
    last_saved_at: Option<Instant>,
    last_tier: Option<SnapshotTier>,
    saves: usize,
}

/// 持久化管理器
pub struct PersistenceManager {
    store: Arc<dyn SnapshotStore>,
    budget_bytes: usize,
    ttl: Duration,
    min_interval: Duration,
    // 保存互斥执行，防止两次保存交错写入
    state: Mutex<SaveState>,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn SnapshotStore>, budget_bytes: usize) -> Self {
        Self {
            store,
            budget_bytes,
            ttl: Duration::from_secs(2 * 60 * 60),
            min_interval: Duration::ZERO,
            state: Mutex::new(SaveState::default()),
        }
    }

    pub fn from_config(store: Arc<dyn SnapshotStore>, config: &Config) -> Self {
        Self::new(store, config.storage_budget_bytes)
            .with_ttl(Duration::from_secs(config.snapshot_ttl_secs))
            .with_min_interval(Duration::from_millis(config.save_debounce_ms))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// 最近一次成功保存所用的档位
    pub fn last_tier(&self) -> Option<SnapshotTier> {
        self.state.lock().ok().and_then(|s| s.last_tier)
    }

    /// 成功保存的次数
    pub fn save_count(&self) -> usize {
        self.state.lock().map(|s| s.saves).unwrap_or(0)
    }

    /// 立即保存
    pub fn save(&self, task: &Task) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(e) => {
                warn!("⚠️  持久化状态锁已损坏，跳过保存: {}", e);
                return false;
            }
        };
        match self.save_with_fallback(task) {
            Some(tier) => {
                state.last_saved_at = Some(Instant::now());
                state.last_tier = Some(tier);
                state.saves += 1;
                true
            }
            None => false,
        }
    }

    /// 距上次保存超过最小间隔才保存，用于每个波次结束后的自动保存
    pub fn save_if_due(&self, task: &Task) -> bool {
        let due = self
            .state
            .lock()
            .map(|s| {
                s.last_saved_at
                    .map_or(true, |at| at.elapsed() >= self.min_interval)
            })
            .unwrap_or(true);
        if !due {
            debug!("距上次保存不足 {:?}，本次跳过", self.min_interval);
            return false;
        }
        self.save(task)
    }

    /// 强制保存，用于阶段结束和取消之后
    pub fn flush(&self, task: &Task) -> bool {
        self.save(task)
    }

    /// 读取快照；不存在或已损坏返回 None
    pub fn load(&self, task_id: &str) -> Option<Snapshot> {
        let key = snapshot_key(task_id);
        let bytes = match self.store.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("⚠️  读取快照 {} 失败: {}", key, e);
                return None;
            }
        };
        match Snapshot::from_bytes(&bytes) {
            Ok(snapshot) => {
                info!(
                    "📂 已加载快照 {} ({}档, {} 个条目)",
                    key,
                    snapshot.tier,
                    snapshot.items.len()
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!("⚠️  快照 {} 已损坏，忽略: {}", key, e);
                None
            }
        }
    }

    /// 删除快照（任务被丢弃或全部导出后）
    pub fn clear(&self, task_id: &str) -> bool {
        let key = snapshot_key(task_id);
        match self.store.remove(&key) {
            Ok(()) => {
                debug!("已删除快照 {}", key);
                true
            }
            Err(e) => {
                warn!("⚠️  删除快照 {} 失败: {}", key, e);
                false
            }
        }
    }

    /// 列出所有快照的头部
    pub fn list_snapshots(&self) -> Vec<SnapshotHeader> {
        let keys = match self.store.list_keys(KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("⚠️  列出快照失败: {}", e);
                return Vec::new();
            }
        };
        keys.iter()
            .filter_map(|key| self.store.get(key).ok().flatten())
            .filter_map(|bytes| serde_json::from_slice::<SnapshotHeader>(&bytes).ok())
            .collect()
    }

    fn save_with_fallback(&self, task: &Task) -> Option<SnapshotTier> {
        let key = snapshot_key(&task.id);
        let mut evicted = false;
        let mut quota_hit = false;

        for tier in [SnapshotTier::Full, SnapshotTier::Stripped, SnapshotTier::Minimal] {
            let bytes = match Snapshot::from_task(task, tier).to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("⚠️  快照序列化失败: {}", e);
                    return None;
                }
            };
            if bytes.len() > self.budget_bytes {
                debug!(
                    "{}档快照 {} 字节超出预算 {} 字节",
                    tier,
                    bytes.len(),
                    self.budget_bytes
                );
                if !evicted {
                    self.evict_expired(&task.id);
                    evicted = true;
                }
                // 最小档没有再降的余地，超出预算也照常写入，由存储配额决定成败
                if tier != SnapshotTier::Minimal {
                    continue;
                }
                warn!(
                    "⚠️  最小快照 {} 字节仍超出预算 {} 字节，尝试直接写入",
                    bytes.len(),
                    self.budget_bytes
                );
            }

            match self.store.put(&key, &bytes) {
                Ok(()) => {
                    if tier != SnapshotTier::Full {
                        info!("💾 快照已降级为{}档保存 ({} 字节)", tier, bytes.len());
                    }
                    return Some(tier);
                }
                Err(PersistenceError::QuotaExceeded { .. }) if !evicted => {
                    quota_hit = true;
                    evicted = true;
                    if self.evict_expired(&task.id) > 0 && self.store.put(&key, &bytes).is_ok() {
                        return Some(tier);
                    }
                }
                Err(PersistenceError::QuotaExceeded { .. }) => quota_hit = true,
                Err(e) => {
                    warn!("⚠️  保存快照失败: {}", e);
                    return None;
                }
            }
        }

        // 只有存储真的报了配额错误才清空其他任务的快照
        if !quota_hit {
            return None;
        }
        self.clear_all_and_retry_minimal(task, &key)
    }

    fn clear_all_and_retry_minimal(&self, task: &Task, key: &str) -> Option<SnapshotTier> {
        warn!("⚠️  存储空间不足，清空所有任务快照后重试最小快照");
        if let Ok(keys) = self.store.list_keys(KEY_PREFIX) {
            for k in keys {
                let _ = self.store.remove(&k);
            }
        }
        let bytes = Snapshot::from_task(task, SnapshotTier::Minimal)
            .to_bytes()
            .ok()?;
        match self.store.put(key, &bytes) {
            Ok(()) => Some(SnapshotTier::Minimal),
            Err(e) => {
                warn!("⚠️  最小快照仍无法保存，本轮放弃: {}", e);
                None
            }
        }
    }

    /// 淘汰其他任务中超过 TTL 的快照，返回淘汰数量
    fn evict_expired(&self, current_task: &str) -> usize {
        let ttl = match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => ttl,
            Err(_) => return 0,
        };
        let cutoff = Utc::now() - ttl;
        let mut evicted = 0;
        for header in self.list_snapshots() {
            if header.task_id == current_task || header.saved_at > cutoff {
                continue;
            }
            if self.store.remove(&snapshot_key(&header.task_id)).is_ok() {
                debug!("淘汰过期快照 {}", header.task_id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!("🧹 已淘汰 {} 个过期快照", evicted);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Item, SourceRef, TaskConfig};
    use crate::persistence::store::MemoryStore;

    fn task(images: usize, image_size: usize) -> Task {
        let items = (0..images)
            .map(|i| Item::new(format!("p{}", i), SourceRef::inline(format!("p{}.jpg", i), vec![1; image_size])))
            .collect();
        Task::new("持久化", TaskConfig::default(), items)
    }

    #[test]
    fn test_small_task_saves_full() {
        let store = Arc::new(MemoryStore::new(1 << 20));
        let manager = PersistenceManager::new(store, 1 << 20);
        let task = task(2, 100);
        assert!(manager.save(&task));
        assert_eq!(manager.last_tier(), Some(SnapshotTier::Full));
        let loaded = manager.load(&task.id).unwrap();
        assert_eq!(loaded.items.len(), 2);
    }

    #[test]
    fn test_over_budget_save_keeps_fresh_neighbours() {
        let store = Arc::new(MemoryStore::new(50 << 20));
        let neighbour = task(1, 10);
        PersistenceManager::new(store.clone(), 1 << 20).save(&neighbour);

        let manager = PersistenceManager::new(store.clone(), 200);
        let current = task(3, 100);
        assert!(manager.save(&current));
        assert_eq!(manager.last_tier(), Some(SnapshotTier::Minimal));
        assert!(store.get(&snapshot_key(&neighbour.id)).unwrap().is_some());
        assert!(store.get(&snapshot_key(&current.id)).unwrap().is_some());
    }

    #[test]
    fn test_debounce_skips_rapid_saves() {
        let store = Arc::new(MemoryStore::new(1 << 20));
        let manager =
            PersistenceManager::new(store, 1 << 20).with_min_interval(Duration::from_secs(60));
        let task = task(1, 10);
        assert!(manager.save_if_due(&task));
        assert!(!manager.save_if_due(&task));
        assert!(manager.flush(&task));
        assert_eq!(manager.save_count(), 2);
    }

    #[test]
    fn test_expired_snapshots_of_other_tasks_are_evicted() {
        let store = Arc::new(MemoryStore::new(1 << 20));
        let manager = PersistenceManager::new(store.clone(), 1 << 20).with_ttl(Duration::ZERO);
        let old = task(1, 10);
        assert!(manager.save(&old));

        let big = task(4, 2000);
        let manager = PersistenceManager::new(store.clone(), 4000).with_ttl(Duration::ZERO);
        assert!(manager.save(&big));
        assert!(manager.load(&old.id).is_none());
        assert_eq!(store.list_keys(KEY_PREFIX).unwrap(), vec![snapshot_key(&big.id)]);
    }

    #[test]
    fn test_quota_error_clears_everything_then_saves_minimal() {
        let store = Arc::new(MemoryStore::new(1200));
        let filler = b"x".repeat(1000);
        store.put("task:someone-else", &filler).unwrap();

        let manager = PersistenceManager::new(store.clone(), 1 << 20);
        let task = task(2, 10);
        assert!(manager.save(&task));
        assert_eq!(manager.last_tier(), Some(SnapshotTier::Minimal));
        assert!(store.get("task:someone-else").unwrap().is_none());
    }

    #[test]
    fn test_hopeless_save_returns_false() {
        let store = Arc::new(MemoryStore::new(8));
        let manager = PersistenceManager::new(store, 1 << 20);
        assert!(!manager.save(&task(3, 10)));
        assert_eq!(manager.last_tier(), None);
    }
}
