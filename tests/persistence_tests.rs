use chrono::Utc;
use essay_batch::models::{
    Item, ItemStatus, Preview, SourceRef, Stage, StageOutput, Task, TaskConfig, TaskEvent,
};
use essay_batch::persistence::{
    snapshot_key, FileStore, MemoryStore, PersistenceManager, Snapshot, SnapshotStore,
    SnapshotTier,
};
use std::sync::Arc;

fn scanned_task(n: usize, image_bytes: usize) -> Task {
    let items = (0..n)
        .map(|i| {
            Item::new(
                format!("essay-{:03}", i),
                SourceRef::inline(format!("{:03}.jpg", i), vec![(i % 251) as u8; image_bytes]),
            )
        })
        .collect();
    let config = TaskConfig {
        roster: vec!["李雷".into(), "韩梅梅".into()],
        source_dir: Some("/scans/三年级".into()),
        ..Default::default()
    };
    Task::new("期末作文", config, items)
}

fn complete(task: &mut Task, id: &str, stage: Stage, output: StageOutput) {
    task.apply(&TaskEvent::StageStarted { stage }).unwrap();
    task.apply(&TaskEvent::ItemStarted {
        item_id: id.into(),
        stage,
        rerun: false,
    })
    .unwrap();
    task.apply(&TaskEvent::ItemSucceeded {
        item_id: id.into(),
        stage,
        output,
        attempts: 1,
    })
    .unwrap();
}

#[test]
fn test_large_images_fall_back_to_stripped_tier() {
    let store = Arc::new(MemoryStore::new(50 * 1024 * 1024));
    let manager = PersistenceManager::new(store, 500 * 1024);
    let mut task = scanned_task(50, 20 * 1024);
    complete(
        &mut task,
        "essay-000",
        Stage::Ingest,
        StageOutput::Ingested {
            image: None,
            size_bytes: 20 * 1024,
        },
    );

    assert!(manager.save(&task));
    assert_eq!(manager.last_tier(), Some(SnapshotTier::Stripped));

    let restored = manager.load(&task.id).unwrap().into_task();
    assert_eq!(restored.items.len(), 50);
    assert_eq!(restored.config.roster.len(), 2);
    assert_eq!(
        restored.item("essay-000").unwrap().status(Stage::Ingest),
        ItemStatus::Completed
    );
    for item in &restored.items {
        assert!(item.source.image_dropped);
        assert!(matches!(
            item.source.preview(),
            Preview::Placeholder { size_bytes, .. } if size_bytes == 20 * 1024
        ));
    }
}

#[test]
fn test_small_task_keeps_images() {
    let store = Arc::new(MemoryStore::new(10 * 1024 * 1024));
    let manager = PersistenceManager::new(store, 5 * 1024 * 1024);
    let task = scanned_task(3, 512);

    assert!(manager.save(&task));
    assert_eq!(manager.last_tier(), Some(SnapshotTier::Full));
    let restored = manager.load(&task.id).unwrap().into_task();
    assert_eq!(restored.items[1].source.image.as_deref(), Some(&[1u8; 512][..]));
}

#[test]
fn test_minimal_snapshot_round_trip() {
    let mut task = scanned_task(4, 64);
    complete(
        &mut task,
        "essay-002",
        Stage::Ingest,
        StageOutput::Ingested {
            image: None,
            size_bytes: 64,
        },
    );
    task.apply(&TaskEvent::ItemStarted {
        item_id: "essay-003".into(),
        stage: Stage::Ingest,
        rerun: false,
    })
    .unwrap();

    let snapshot = Snapshot::from_task(&task, SnapshotTier::Minimal);
    assert!(snapshot.config.is_none());
    let bytes = snapshot.to_bytes().unwrap();
    let restored = Snapshot::from_bytes(&bytes).unwrap().into_task();

    assert_eq!(restored.id, task.id);
    assert_eq!(restored.title, "期末作文");
    assert_eq!(
        restored.item("essay-002").unwrap().status(Stage::Ingest),
        ItemStatus::Completed
    );
    // 处理中的条目恢复为 Pending
    assert_eq!(
        restored.item("essay-003").unwrap().status(Stage::Ingest),
        ItemStatus::Pending
    );
    assert!(restored.items.iter().all(|item| item.source.image.is_none()));

    // 重新扫描输入目录后补全来源
    let mut restored = restored;
    let rehydrated = restored.rehydrate_sources(&task.items);
    assert_eq!(rehydrated, 4);
    assert!(restored.items[0].source.image.is_some());
}

#[test]
fn test_quota_exhaustion_clears_all_and_saves_minimal() {
    let store = Arc::new(MemoryStore::new(4000));
    store.put("task:stale-neighbour", &vec![b'x'; 3500]).unwrap();
    let manager = PersistenceManager::new(store.clone(), 5 * 1024 * 1024);
    let task = scanned_task(3, 1024);

    assert!(manager.save(&task));
    assert_eq!(manager.last_tier(), Some(SnapshotTier::Minimal));
    assert!(store.get("task:stale-neighbour").unwrap().is_none());
    assert!(store.get(&snapshot_key(&task.id)).unwrap().is_some());
}

#[test]
fn test_expired_snapshots_are_evicted_first() {
    let store = Arc::new(MemoryStore::new(8000));
    let old_task = scanned_task(1, 16);
    let mut old = Snapshot::from_task(&old_task, SnapshotTier::Minimal);
    old.saved_at = Utc::now() - chrono::Duration::hours(3);
    let mut old_bytes = old.to_bytes().unwrap();
    // 撑大旧快照，让新快照放不下
    old_bytes.extend(std::iter::repeat(b' ').take(6000 - old_bytes.len()));
    store.put(&snapshot_key(&old_task.id), &old_bytes).unwrap();

    let manager = PersistenceManager::new(store.clone(), 5 * 1024 * 1024);
    let task = scanned_task(2, 1024);
    assert!(manager.save(&task));
    assert_eq!(manager.last_tier(), Some(SnapshotTier::Full));
    assert!(store.get(&snapshot_key(&old_task.id)).unwrap().is_none());
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let task = scanned_task(2, 128);
    {
        let store = Arc::new(FileStore::open(dir.path(), 1024 * 1024).unwrap());
        let manager = PersistenceManager::new(store, 512 * 1024);
        assert!(manager.save(&task));
    }

    let store = Arc::new(FileStore::open(dir.path(), 1024 * 1024).unwrap());
    let manager = PersistenceManager::new(store, 512 * 1024);
    let headers = manager.list_snapshots();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].task_id, task.id);

    let restored = manager.load(&task.id).unwrap().into_task();
    assert_eq!(restored.items.len(), 2);
    assert_eq!(restored.config.source_dir.as_deref(), Some("/scans/三年级"));

    assert!(manager.clear(&task.id));
    assert!(manager.load(&task.id).is_none());
}
