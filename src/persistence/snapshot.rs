//! 任务快照
//!
//! 快照是 `Task` 的可序列化投影，分三档：
//! - `Full`：完整数据，包括图片（base64）
//! - `Stripped`：去掉图片字节，只保留文件名和大小
//! - `Minimal`：只保留条目 id、各阶段状态和计数
//!
//! 任何一档都能还原成可运行的 `Task`，缺失的图片以占位预览代替。

use crate::error::PersistenceError;
use crate::models::{
    BatchError, GradeResult, Identity, Item, ItemStatus, Recognition, SourceRef, Stage,
    StageCounts, StageState, Task, TaskConfig, TaskStatus,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SNAPSHOT_VERSION: u32 = 1;

/// 快照档位，越往后越精简
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTier {
    Full,
    Stripped,
    Minimal,
}

impl std::fmt::Display for SnapshotTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SnapshotTier::Full => "完整",
            SnapshotTier::Stripped => "去图",
            SnapshotTier::Minimal => "最小",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub image_dropped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: String,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<Recognition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<GradeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
}

/// 任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub tier: SnapshotTier,
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub target_stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    pub items: Vec<ItemSnapshot>,
    #[serde(default)]
    pub counts: BTreeMap<Stage, StageCounts>,
    #[serde(default)]
    pub errors: Vec<BatchError>,
}

/// 快照头部，淘汰过期快照时只解析这几个字段
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotHeader {
    pub task_id: String,
    pub saved_at: DateTime<Utc>,
    pub tier: SnapshotTier,
}

impl Snapshot {
    /// 按指定档位生成快照
    pub fn from_task(task: &Task, tier: SnapshotTier) -> Self {
        let items = task.items.iter().map(|item| item_snapshot(item, tier)).collect();
        let counts = Stage::ALL
            .into_iter()
            .map(|stage| (stage, task.counts(stage)))
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            tier,
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            created_at: task.created_at,
            saved_at: Utc::now(),
            current_stage: task.current_stage,
            target_stage: task.target_stage,
            config: (tier != SnapshotTier::Minimal).then(|| task.config.clone()),
            items,
            counts,
            errors: if tier == SnapshotTier::Minimal {
                Vec::new()
            } else {
                task.errors.clone()
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistenceError> {
        serde_json::to_vec(self).map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistenceError> {
        serde_json::from_slice(bytes).map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    /// 还原成运行时任务
    ///
    /// 上次中断时仍在处理中的条目回到 Pending，任务记为 Paused；图片缺失的条目使用占位来源。
    pub fn into_task(self) -> Task {
        let items = self.items.into_iter().map(restore_item).collect();
        let status = match self.status {
            TaskStatus::Running => TaskStatus::Paused,
            other => other,
        };
        Task {
            id: self.task_id,
            title: self.title,
            config: self.config.unwrap_or_default(),
            items,
            status,
            created_at: self.created_at,
            current_stage: self.current_stage,
            target_stage: self.target_stage,
            errors: self.errors,
        }
    }
}

fn item_snapshot(item: &Item, tier: SnapshotTier) -> ItemSnapshot {
    let stages = item
        .stages
        .iter()
        .map(|(stage, state)| {
            let state = if tier == SnapshotTier::Minimal {
                StageState {
                    status: state.status,
                    attempts: state.attempts,
                    ..Default::default()
                }
            } else {
                state.clone()
            };
            (*stage, state)
        })
        .collect();

    if tier == SnapshotTier::Minimal {
        return ItemSnapshot {
            id: item.id.clone(),
            stages,
            source: None,
            extracted: None,
            edited_text: None,
            confirmed_text: None,
            identity: None,
            grade: None,
            export_path: None,
        };
    }

    let source = &item.source;
    let image_base64 = match tier {
        SnapshotTier::Full => source.image.as_ref().map(|bytes| STANDARD.encode(bytes)),
        _ => None,
    };
    let image_dropped = source.image_dropped || (source.image.is_some() && image_base64.is_none());

    ItemSnapshot {
        id: item.id.clone(),
        stages,
        source: Some(SourceSnapshot {
            path: source.path.clone(),
            file_name: source.file_name.clone(),
            size_bytes: source.size_bytes,
            mime: source.mime.clone(),
            image_base64,
            image_dropped,
        }),
        extracted: item.extracted.clone(),
        edited_text: item.edited_text.clone(),
        confirmed_text: item.confirmed_text.clone(),
        identity: item.identity.clone(),
        grade: item.grade.clone(),
        export_path: item.export_path.clone(),
    }
}

fn restore_item(snapshot: ItemSnapshot) -> Item {
    let source = match snapshot.source {
        Some(src) => {
            let image = src
                .image_base64
                .as_deref()
                .and_then(|encoded| STANDARD.decode(encoded).ok());
            match image {
                Some(bytes) => SourceRef {
                    path: src.path,
                    file_name: src.file_name,
                    size_bytes: src.size_bytes,
                    mime: src.mime,
                    image: Some(bytes),
                    image_dropped: false,
                },
                None if src.image_dropped => {
                    let mut placeholder = SourceRef::placeholder(src.file_name, src.size_bytes);
                    placeholder.path = src.path;
                    placeholder
                }
                None => match src.path {
                    Some(path) => SourceRef::from_path(path, src.file_name, src.size_bytes),
                    None => SourceRef::placeholder(src.file_name, src.size_bytes),
                },
            }
        }
        None => SourceRef::placeholder(snapshot.id.clone(), 0),
    };

    let mut item = Item::new(snapshot.id, source);
    item.stages = snapshot
        .stages
        .into_iter()
        .map(|(stage, mut state)| {
            if state.status == ItemStatus::Processing {
                state.status = ItemStatus::Pending;
            }
            (stage, state)
        })
        .collect();
    item.extracted = snapshot.extracted;
    item.edited_text = snapshot.edited_text;
    item.confirmed_text = snapshot.confirmed_text;
    item.identity = snapshot.identity;
    item.grade = snapshot.grade;
    item.export_path = snapshot.export_path;
    item
}
