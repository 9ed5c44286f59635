//! 持久化层：任务快照的分档保存与恢复

pub mod manager;
pub mod snapshot;
pub mod store;

pub use manager::{snapshot_key, PersistenceManager, KEY_PREFIX};
pub use snapshot::{Snapshot, SnapshotHeader, SnapshotTier};
pub use store::{FileStore, MemoryStore, SnapshotStore};
