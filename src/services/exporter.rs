//! 结果导出
//!
//! 目录结构：
//!
//! ```text
//! output/
//! ├── <task-id>/
//! │   ├── <item-id>.json   每份作文一份
//! │   └── ...
//! └── <task-id>.json       全部条目的汇总
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AppError, AppResult, OperationError};
use crate::models::{GradeResult, Identity, Item, ItemStatus, Stage, StageCounts, Task};

/// 单份作文的导出记录（只读视图）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub item_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// 最终确认的文本
    pub text: String,
    /// 用户修改过文本
    pub edited: bool,
    pub grade: GradeResult,
}

impl ExportRecord {
    /// 只有评分完成的条目可以导出
    pub fn from_item(item: &Item) -> Result<Self, OperationError> {
        let grade = item
            .grade
            .clone()
            .ok_or_else(|| OperationError::permanent(format!("条目 {} 尚未评分", item.id)))?;
        let text = item
            .confirmed_text
            .clone()
            .or_else(|| item.current_text().map(str::to_string))
            .unwrap_or_default();
        Ok(Self {
            item_id: item.id.clone(),
            file_name: item.source.file_name.clone(),
            identity: item.identity.clone(),
            text,
            edited: item.edited_text.is_some(),
            grade,
        })
    }
}

/// 整个任务的导出汇总
#[derive(Debug, Serialize)]
pub struct TaskExport<'a> {
    pub task_id: &'a str,
    pub title: &'a str,
    pub exported_at: DateTime<Utc>,
    pub counts: StageCounts,
    pub records: Vec<ExportRecord>,
    /// 未能导出的条目及原因
    pub failures: Vec<ExportFailure<'a>>,
}

#[derive(Debug, Serialize)]
pub struct ExportFailure<'a> {
    pub item_id: &'a str,
    pub stage: Stage,
    pub error: &'a str,
}

impl<'a> TaskExport<'a> {
    pub fn from_task(task: &'a Task) -> Self {
        let records = task
            .items
            .iter()
            .filter(|item| item.status(Stage::Grade) == ItemStatus::Completed)
            .filter_map(|item| ExportRecord::from_item(item).ok())
            .collect();
        let failures = task
            .items
            .iter()
            .filter_map(|item| {
                Stage::ALL.into_iter().find_map(|stage| {
                    item.error(stage).map(|error| ExportFailure {
                        item_id: &item.id,
                        stage,
                        error,
                    })
                })
            })
            .collect();
        Self {
            task_id: &task.id,
            title: &task.title,
            exported_at: Utc::now(),
            counts: task.counts(Stage::Grade),
            records,
            failures,
        }
    }
}

/// 导出能力
#[async_trait]
pub trait Exporter: Send + Sync {
    /// 导出单个条目，返回写入位置
    async fn export_item(&self, task_id: &str, record: &ExportRecord) -> Result<String, OperationError>;

    /// 写入任务汇总，返回写入位置
    async fn finalize(&self, task: &Task) -> AppResult<String>;
}

/// 写 JSON 文件的导出器
pub struct JsonExporter {
    output_dir: PathBuf,
}

impl JsonExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn item_path(&self, task_id: &str, item_id: &str) -> PathBuf {
        self.output_dir.join(task_id).join(format!("{}.json", item_id))
    }
}

#[async_trait]
impl Exporter for JsonExporter {
    async fn export_item(&self, task_id: &str, record: &ExportRecord) -> Result<String, OperationError> {
        let path = self.item_path(task_id, &record.item_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| OperationError::transient(format!("创建目录 {} 失败: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| OperationError::permanent(format!("序列化失败: {}", e)))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| OperationError::transient(format!("写入 {} 失败: {}", path.display(), e)))?;
        Ok(path.display().to_string())
    }

    async fn finalize(&self, task: &Task) -> AppResult<String> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| AppError::file_write_failed(self.output_dir.display().to_string(), e))?;
        let path = self.output_dir.join(format!("{}.json", task.id));
        let summary = TaskExport::from_task(task);
        let json = serde_json::to_vec_pretty(&summary)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| AppError::file_write_failed(path.display().to_string(), e))?;
        info!(
            "📤 已导出 {} 份结果至 {}",
            summary.records.len(),
            path.display()
        );
        Ok(path.display().to_string())
    }
}
