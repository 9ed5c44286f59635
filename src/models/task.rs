//! 任务模型
//!
//! `Task` 是一次批量批改的唯一权威状态。所有修改都通过 [`Task::apply`]
//! 以 `(旧状态, 事件) -> 新状态` 的方式进行，调度器、进度和持久化都只读取它的投影。

use crate::error::{AppError, AppResult};
use crate::models::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// 条目在某个阶段的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// 任务整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Setup,
    Running,
    /// 阶段已结束但还有条目没跑完，可以续跑
    Paused,
    Completed,
    Failed,
}

/// 扫描件来源
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRef {
    /// 本地路径；最小快照恢复出来的条目没有路径
    pub path: Option<String>,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime: String,
    /// 已读入内存的图片
    pub image: Option<Vec<u8>>,
    /// 图片因存储预算被丢弃过
    pub image_dropped: bool,
}

/// 预览：原图或占位
#[derive(Debug, Clone, PartialEq)]
pub enum Preview<'a> {
    Inline { mime: &'a str, bytes: &'a [u8] },
    Placeholder { file_name: &'a str, size_bytes: u64 },
}

impl SourceRef {
    pub fn from_path(path: impl Into<String>, file_name: impl Into<String>, size_bytes: u64) -> Self {
        let file_name = file_name.into();
        Self {
            mime: mime_for(&file_name).to_string(),
            path: Some(path.into()),
            file_name,
            size_bytes,
            image: None,
            image_dropped: false,
        }
    }

    /// 内存中的图片（测试和嵌入式调用方使用）
    pub fn inline(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        Self {
            mime: mime_for(&file_name).to_string(),
            path: None,
            size_bytes: bytes.len() as u64,
            file_name,
            image: Some(bytes),
            image_dropped: false,
        }
    }

    /// 图片被丢弃后的占位来源
    pub fn placeholder(file_name: impl Into<String>, size_bytes: u64) -> Self {
        let file_name = file_name.into();
        Self {
            mime: mime_for(&file_name).to_string(),
            path: None,
            file_name,
            size_bytes,
            image: None,
            image_dropped: true,
        }
    }

    pub fn preview(&self) -> Preview<'_> {
        match &self.image {
            Some(bytes) => Preview::Inline {
                mime: &self.mime,
                bytes,
            },
            None => Preview::Placeholder {
                file_name: &self.file_name,
                size_bytes: self.size_bytes,
            },
        }
    }
}

/// 根据扩展名推断 MIME
pub fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// 识别结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub text: String,
    pub confidence: f64,
}

/// 学生身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub student: String,
    /// 是否在花名册中匹配到
    pub matched: bool,
}

/// 评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    pub score: f64,
    pub feedback: String,
    /// 润色后的范文
    pub improved: String,
}

/// 单个阶段对单个条目的产出
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// 图片已就绪；`image` 为新读入的图片
    Ingested { image: Option<Vec<u8>>, size_bytes: u64 },
    Recognized(Recognition),
    Confirmed { text: String },
    Identified(Identity),
    Graded(GradeResult),
    Exported { path: String },
}

/// 条目在某个阶段的状态记录
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageState {
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// 一份扫描件
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub source: SourceRef,
    /// 识别出的原始文本，用户修改后依然保留，用于恢复原文
    pub extracted: Option<Recognition>,
    pub edited_text: Option<String>,
    pub confirmed_text: Option<String>,
    pub identity: Option<Identity>,
    pub grade: Option<GradeResult>,
    pub export_path: Option<String>,
    pub stages: BTreeMap<Stage, StageState>,
}

impl Item {
    pub fn new(id: impl Into<String>, source: SourceRef) -> Self {
        Self {
            id: id.into(),
            source,
            extracted: None,
            edited_text: None,
            confirmed_text: None,
            identity: None,
            grade: None,
            export_path: None,
            stages: BTreeMap::new(),
        }
    }

    pub fn status(&self, stage: Stage) -> ItemStatus {
        self.stages
            .get(&stage)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn error(&self, stage: Stage) -> Option<&str> {
        self.stages.get(&stage).and_then(|s| s.error.as_deref())
    }

    /// 当前有效文本：用户修改优先，其次是识别原文
    pub fn current_text(&self) -> Option<&str> {
        self.edited_text
            .as_deref()
            .or_else(|| self.extracted.as_ref().map(|r| r.text.as_str()))
    }

    /// 用于日志和进度的显示名
    pub fn label(&self) -> &str {
        match &self.identity {
            Some(identity) if identity.matched => &identity.student,
            _ => &self.source.file_name,
        }
    }

    /// 条目在到达 `target` 之前是否已经走完（完成，或在某一阶段失败而停下）
    pub fn is_settled_through(&self, target: Stage) -> bool {
        for stage in target.up_to() {
            match self.status(stage) {
                ItemStatus::Completed => continue,
                ItemStatus::Failed => return true,
                _ => return false,
            }
        }
        true
    }

    fn state_mut(&mut self, stage: Stage) -> &mut StageState {
        self.stages.entry(stage).or_default()
    }

    fn record_output(&mut self, output: &StageOutput) {
        match output {
            StageOutput::Ingested { image, size_bytes } => {
                if let Some(bytes) = image {
                    self.source.image = Some(bytes.clone());
                    self.source.image_dropped = false;
                }
                self.source.size_bytes = *size_bytes;
            }
            StageOutput::Recognized(recognition) => {
                self.extracted = Some(recognition.clone());
            }
            StageOutput::Confirmed { text } => self.confirmed_text = Some(text.clone()),
            StageOutput::Identified(identity) => self.identity = Some(identity.clone()),
            StageOutput::Graded(grade) => self.grade = Some(grade.clone()),
            StageOutput::Exported { path } => self.export_path = Some(path.clone()),
        }
    }

    /// 某阶段产出了新结果，依赖它的已结算阶段回到 Pending
    fn invalidate_dependents(&mut self, stage: Stage) {
        for dependent in stage.downstream().filter(|d| d.depends_on(stage)) {
            if let Some(state) = self.stages.get_mut(&dependent) {
                if state.status.is_terminal() {
                    state.status = ItemStatus::Pending;
                    state.error = None;
                }
            }
        }
    }

    /// 文本变化后，确认及其下游阶段的结果都已过期
    fn invalidate_from_confirm(&mut self) -> AppResult<()> {
        let stale: Vec<Stage> = std::iter::once(Stage::Confirm)
            .chain(Stage::Confirm.downstream())
            .collect();
        if let Some(stage) = stale
            .iter()
            .find(|s| self.status(**s) == ItemStatus::Processing)
        {
            return Err(AppError::misuse(format!(
                "条目 {} 正在{}，不能修改文本",
                self.id, stage
            )));
        }
        for stage in stale {
            if let Some(state) = self.stages.get_mut(&stage) {
                state.status = ItemStatus::Pending;
                state.error = None;
            }
        }
        Ok(())
    }
}

/// 评分上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradingContext {
    pub subject: String,
    pub rubric: String,
    pub max_score: f64,
    pub language: String,
}

impl Default for GradingContext {
    fn default() -> Self {
        Self {
            subject: "语文".to_string(),
            rubric: "按内容、结构、语言三个维度综合评分".to_string(),
            max_score: 100.0,
            language: "zh".to_string(),
        }
    }
}

/// 任务级配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub grading: GradingContext,
    /// 学生花名册
    pub roster: Vec<String>,
    /// 扫描件所在目录
    pub source_dir: Option<String>,
}

/// 批次级错误记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// 任务状态变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// 设置本任务要走到的最后一个阶段
    TargetSet {
        stage: Stage,
    },
    StageStarted {
        stage: Stage,
    },
    /// `rerun` 为真时允许已完成的条目重新处理（例如重新评分）
    ItemStarted {
        item_id: String,
        stage: Stage,
        rerun: bool,
    },
    ItemSucceeded {
        item_id: String,
        stage: Stage,
        output: StageOutput,
        attempts: u32,
    },
    ItemFailed {
        item_id: String,
        stage: Stage,
        error: String,
        attempts: u32,
    },
    /// 取消后回到 Pending
    ItemReset {
        item_id: String,
        stage: Stage,
    },
    ItemEdited {
        item_id: String,
        text: String,
    },
    ItemEditReverted {
        item_id: String,
    },
    /// `only_failed` 为真对应“重试失败项”，否则对应“全部重试”
    StageReset {
        stage: Stage,
        only_failed: bool,
    },
    StageFinished {
        stage: Stage,
    },
    BatchFailed {
        stage: Stage,
        reason: String,
    },
}

/// 某阶段的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// 一次批量批改任务
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub config: TaskConfig,
    pub items: Vec<Item>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub current_stage: Option<Stage>,
    /// 本任务要走到的最后一个阶段
    pub target_stage: Stage,
    pub errors: Vec<BatchError>,
}

/// 保证条目 ID 唯一：重复的 ID 依次加上 `-2`、`-3` 后缀，第一次出现的保持不变
///
/// 返回被改名的条目数。
pub fn dedupe_item_ids(items: &mut [Item]) -> usize {
    let mut seen: HashSet<String> = items.iter().map(|item| item.id.clone()).collect();
    let mut first_seen = HashSet::new();
    let mut renamed = 0;
    for item in items.iter_mut() {
        if first_seen.insert(item.id.clone()) {
            continue;
        }
        let mut n = 2;
        let fresh = loop {
            let candidate = format!("{}-{}", item.id, n);
            if !seen.contains(&candidate) {
                break candidate;
            }
            n += 1;
        };
        tracing::warn!("⚠️ 条目 ID {} 重复，{} 改名为 {}", item.id, item.source.file_name, fresh);
        seen.insert(fresh.clone());
        first_seen.insert(fresh.clone());
        item.id = fresh;
        renamed += 1;
    }
    renamed
}

impl Task {
    pub fn new(title: impl Into<String>, config: TaskConfig, mut items: Vec<Item>) -> Self {
        dedupe_item_ids(&mut items);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            config,
            items,
            status: TaskStatus::Setup,
            created_at: Utc::now(),
            current_stage: None,
            target_stage: Stage::Export,
            errors: Vec::new(),
        }
    }

    pub fn with_target_stage(mut self, stage: Stage) -> Self {
        self.target_stage = stage;
        self
    }

    pub fn item(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    fn item_mut(&mut self, id: &str) -> AppResult<&mut Item> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| AppError::misuse(format!("未知条目: {}", id)))
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        let mut counts = StageCounts {
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            match item.status(stage) {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// 本阶段可以处理的条目下标
    ///
    /// 只挑选本阶段处于 Pending 的条目；已完成的条目只有出现在 `rerun_ids` 中才会重跑。
    /// 输入阶段尚未完成的条目保持 Pending，不会被调度。
    pub fn eligible(&self, stage: Stage, rerun_ids: &[String]) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                let inputs_done = stage
                    .inputs()
                    .iter()
                    .all(|input| item.status(*input) == ItemStatus::Completed);
                if !inputs_done {
                    return false;
                }
                match item.status(stage) {
                    ItemStatus::Pending => true,
                    ItemStatus::Completed => rerun_ids.iter().any(|id| id == &item.id),
                    ItemStatus::Processing | ItemStatus::Failed => false,
                }
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// 所有条目都已走完目标阶段（全部导出完毕时快照可以删除）
    pub fn is_settled(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.is_settled_through(self.target_stage))
    }

    /// 应用一个状态变更事件
    pub fn apply(&mut self, event: &TaskEvent) -> AppResult<()> {
        let now = Utc::now();
        match event {
            TaskEvent::TargetSet { stage } => {
                self.target_stage = *stage;
            }
            TaskEvent::StageStarted { stage } => {
                self.current_stage = Some(*stage);
                self.status = TaskStatus::Running;
            }
            TaskEvent::ItemStarted {
                item_id,
                stage,
                rerun,
            } => {
                let item = self.item_mut(item_id)?;
                match item.status(*stage) {
                    ItemStatus::Pending => {}
                    ItemStatus::Completed if *rerun => {}
                    other => {
                        return Err(AppError::misuse(format!(
                            "条目 {} 在{}阶段处于 {:?}，不能开始处理",
                            item_id, stage, other
                        )))
                    }
                }
                let state = item.state_mut(*stage);
                state.status = ItemStatus::Processing;
                state.error = None;
                state.updated_at = Some(now);
            }
            TaskEvent::ItemSucceeded {
                item_id,
                stage,
                output,
                attempts,
            } => {
                let item = self.item_mut(item_id)?;
                ensure_processing(item, *stage)?;
                item.record_output(output);
                let state = item.state_mut(*stage);
                state.status = ItemStatus::Completed;
                state.error = None;
                state.attempts = *attempts;
                state.updated_at = Some(now);
                item.invalidate_dependents(*stage);
            }
            TaskEvent::ItemFailed {
                item_id,
                stage,
                error,
                attempts,
            } => {
                let item = self.item_mut(item_id)?;
                ensure_processing(item, *stage)?;
                let state = item.state_mut(*stage);
                state.status = ItemStatus::Failed;
                state.error = Some(error.clone());
                state.attempts = *attempts;
                state.updated_at = Some(now);
                self.errors.push(BatchError {
                    item_id: Some(item_id.clone()),
                    stage: *stage,
                    message: error.clone(),
                    at: now,
                });
            }
            TaskEvent::ItemReset { item_id, stage } => {
                let item = self.item_mut(item_id)?;
                if item.status(*stage) == ItemStatus::Completed {
                    return Err(AppError::misuse(format!(
                        "条目 {} 在{}阶段已完成，不能回退",
                        item_id, stage
                    )));
                }
                let state = item.state_mut(*stage);
                state.status = ItemStatus::Pending;
                state.updated_at = Some(now);
            }
            TaskEvent::ItemEdited { item_id, text } => {
                let item = self.item_mut(item_id)?;
                item.invalidate_from_confirm()?;
                item.edited_text = Some(text.clone());
            }
            TaskEvent::ItemEditReverted { item_id } => {
                let item = self.item_mut(item_id)?;
                item.invalidate_from_confirm()?;
                item.edited_text = None;
            }
            TaskEvent::StageReset { stage, only_failed } => {
                if let Some(busy) = self
                    .items
                    .iter()
                    .find(|item| item.status(*stage) == ItemStatus::Processing)
                {
                    return Err(AppError::misuse(format!(
                        "条目 {} 正在{}，不能重置阶段",
                        busy.id, stage
                    )));
                }
                for item in &mut self.items {
                    let reset = match item.status(*stage) {
                        ItemStatus::Failed => true,
                        ItemStatus::Completed => !*only_failed,
                        _ => false,
                    };
                    if reset {
                        let state = item.state_mut(*stage);
                        state.status = ItemStatus::Pending;
                        state.error = None;
                        state.attempts = 0;
                    }
                }
            }
            TaskEvent::StageFinished { .. } => {
                if self.status != TaskStatus::Failed {
                    self.status = TaskStatus::Paused;
                }
            }
            TaskEvent::BatchFailed { stage, reason } => {
                self.errors.push(BatchError {
                    item_id: None,
                    stage: *stage,
                    message: reason.clone(),
                    at: now,
                });
                self.status = TaskStatus::Failed;
                return Ok(());
            }
        }
        self.refresh_status();
        Ok(())
    }

    /// 由条目状态推导任务状态
    fn refresh_status(&mut self) {
        if self.status == TaskStatus::Failed {
            return;
        }
        if self.current_stage.is_none() {
            self.status = TaskStatus::Setup;
            return;
        }
        let any_processing = self.items.iter().any(|item| {
            item.stages
                .values()
                .any(|s| s.status == ItemStatus::Processing)
        });
        self.status = if any_processing {
            TaskStatus::Running
        } else if self.is_settled() {
            TaskStatus::Completed
        } else if self.status == TaskStatus::Paused {
            TaskStatus::Paused
        } else {
            TaskStatus::Running
        };
    }

    /// 用重新扫描得到的条目补全缺失的来源信息（最小快照只保留了 id 和状态）
    pub fn rehydrate_sources(&mut self, fresh: &[Item]) -> usize {
        let mut restored = 0;
        for item in &mut self.items {
            if item.source.path.is_some() && !item.source.image_dropped {
                continue;
            }
            if let Some(found) = fresh.iter().find(|f| f.id == item.id) {
                if found.source.path.is_some() || found.source.image.is_some() {
                    item.source = found.source.clone();
                    restored += 1;
                }
            }
        }
        restored
    }
}

fn ensure_processing(item: &Item, stage: Stage) -> AppResult<()> {
    match item.status(stage) {
        ItemStatus::Processing => Ok(()),
        other => Err(AppError::misuse(format!(
            "条目 {} 在{}阶段处于 {:?}，不能结算",
            item.id, stage, other
        ))),
    }
}
