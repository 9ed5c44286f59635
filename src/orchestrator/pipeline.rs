//! 阶段流水线
//!
//! 所有阶段共用同一套执行方式：挑选可处理的条目 → 按波次调度 → 每次结算写回任务 →
//! 更新进度 → 每个波次后自动保存。不同阶段只在 [`ItemFlow`] 里的单条目操作上有区别。
//!
//! 任务只有一份，放在锁后面；调度器的每次结算都通过 [`Task::apply`] 修改它。

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{ItemStatus, Stage, StageCounts, StageOutput, Task, TaskEvent, TaskStatus};
use crate::orchestrator::cancel::CancellationController;
use crate::orchestrator::progress::{ProgressAggregator, ProgressSnapshot};
use crate::orchestrator::retry::{with_retry, RetryPolicy};
use crate::orchestrator::scheduler::{self, ItemOutcome, WaveObserver, WaveOptions};
use crate::persistence::PersistenceManager;
use crate::utils::logging;
use crate::workflow::{ItemCtx, ItemFlow, ItemInput};
use chrono::Utc;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 本次运行挑选条目的方式
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// 只处理 Pending 的条目（断点续跑）
    #[default]
    Resume,
    /// 失败的条目回到 Pending 后处理
    RetryFailed,
    /// 所有条目回到 Pending 后全部重跑
    RetryAll,
    /// 已完成的指定条目重新处理（例如重新评分）
    Rerun(Vec<String>),
}

/// 流水线参数
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineOptions {
    pub wave: WaveOptions,
    pub retry: RetryPolicy,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            wave: WaveOptions::from_config(config),
            retry: RetryPolicy::from_config(config),
        }
    }
}

/// 一次阶段运行的报告
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    /// 本次调度的条目数
    pub scheduled: usize,
    pub completed: usize,
    pub failed: usize,
    /// 被取消后回到 Pending 的条目数
    pub cancelled: usize,
    pub not_scheduled: usize,
    pub waves_run: usize,
    pub total_waves: usize,
    pub was_cancelled: bool,
    pub batch_failed: bool,
    /// 运行结束后该阶段的计数
    pub counts: StageCounts,
    pub progress: ProgressSnapshot,
    /// 导出阶段写出的汇总文件
    pub export_path: Option<String>,
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] 调度: {}, 成功: {}, 失败: {}, 取消: {}, 未调度: {}, 波次: {}/{}",
            self.stage,
            self.scheduled,
            self.completed,
            self.failed,
            self.cancelled,
            self.not_scheduled,
            self.waves_run,
            self.total_waves
        )
    }
}

/// 本次调度中的一个条目
#[derive(Debug, Clone)]
struct Scheduled {
    item_id: String,
    /// 条目在本阶段已完成，这次是重跑
    rerun: bool,
}

/// 运行标记，离开作用域时自动清除
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 流水线
pub struct Pipeline {
    task: Mutex<Task>,
    flow: Arc<ItemFlow>,
    persistence: Arc<PersistenceManager>,
    progress: ProgressAggregator,
    options: PipelineOptions,
    running: AtomicBool,
}

impl Pipeline {
    pub fn new(
        task: Task,
        flow: Arc<ItemFlow>,
        persistence: Arc<PersistenceManager>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            task: Mutex::new(task),
            flow,
            persistence,
            progress: ProgressAggregator::new(),
            options,
            running: AtomicBool::new(false),
        }
    }

    fn lock_task(&self) -> AppResult<MutexGuard<'_, Task>> {
        self.task
            .lock()
            .map_err(|e| AppError::misuse(format!("任务锁已损坏: {}", e)))
    }

    /// 当前任务的只读拷贝
    pub fn task(&self) -> AppResult<Task> {
        Ok(self.lock_task()?.clone())
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 修改条目文本；原始识别结果保留，确认及下游阶段需要重跑
    pub fn edit_item(&self, item_id: &str, text: impl Into<String>) -> AppResult<()> {
        self.apply_and_save(TaskEvent::ItemEdited {
            item_id: item_id.to_string(),
            text: text.into(),
        })
    }

    /// 放弃修改，恢复识别原文
    pub fn revert_item(&self, item_id: &str) -> AppResult<()> {
        self.apply_and_save(TaskEvent::ItemEditReverted {
            item_id: item_id.to_string(),
        })
    }

    fn apply_and_save(&self, event: TaskEvent) -> AppResult<()> {
        let mut task = self.lock_task()?;
        task.apply(&event)?;
        self.persistence.save_if_due(&task);
        Ok(())
    }

    /// 丢弃任务：删除快照
    pub fn discard(&self) -> AppResult<()> {
        if self.is_running() {
            return Err(AppError::misuse("任务运行中，不能丢弃"));
        }
        let task = self.lock_task()?;
        self.persistence.clear(&task.id);
        info!("🗑️  已丢弃任务 {}", task.id);
        Ok(())
    }

    /// 依次运行从第一个阶段到 `target` 的所有阶段
    ///
    /// 取消或批次不可达时停止，不再进入后续阶段。
    pub async fn run_through(
        &self,
        target: Stage,
        mode: RunMode,
        cancel: &CancellationController,
    ) -> AppResult<Vec<StageReport>> {
        self.lock_task()?.apply(&TaskEvent::TargetSet { stage: target })?;

        let mut reports = Vec::new();
        for stage in target.up_to() {
            let report = self.run_stage(stage, mode.clone(), cancel).await?;
            let stop = report.was_cancelled || report.batch_failed;
            reports.push(report);
            if stop {
                break;
            }
        }
        Ok(reports)
    }

    /// 运行一个阶段
    pub async fn run_stage(
        &self,
        stage: Stage,
        mode: RunMode,
        cancel: &CancellationController,
    ) -> AppResult<StageReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::misuse("同一个任务不能同时运行两次"));
        }
        let _guard = RunGuard(&self.running);
        self.options.wave.validate()?;

        let (scheduled, inputs, total_items) = self.prepare(stage, &mode)?;
        let total_waves = self.options.wave.total_waves(inputs.len());
        logging::log_stage_start(stage, inputs.len(), total_items);
        self.progress.begin_stage(stage, inputs.len(), total_waves);

        let policy = self
            .options
            .retry
            .clone()
            .with_abort_on_cancel(ItemFlow::abortable(stage));
        let flow = self.flow.clone();
        let op_cancel = cancel.clone();
        let operation = move |input: Arc<ItemInput>| {
            let flow = flow.clone();
            let policy = policy.clone();
            let cancel = op_cancel.clone();
            async move {
                with_retry(
                    |_| {
                        let flow = flow.clone();
                        let input = input.clone();
                        async move { flow.run(stage, &input).await }
                    },
                    &policy,
                    &cancel,
                )
                .await
            }
        };

        let mut observer = StageObserver {
            stage,
            task: &self.task,
            progress: &self.progress,
            persistence: &self.persistence,
            scheduled: &scheduled,
            wave_range: 0..0,
            wave_success: 0,
            rejected: HashSet::new(),
            error: None,
        };
        let summary =
            scheduler::run_stage(inputs, operation, &self.options.wave, cancel, &mut observer)
                .await?;
        if let Some(err) = observer.error.take() {
            error!("阶段「{}」状态写回失败: {}", stage, err);
            return Err(err);
        }

        let task_snapshot = {
            let mut task = self.lock_task()?;
            if summary.unreachable {
                task.apply(&TaskEvent::BatchFailed {
                    stage,
                    reason: format!(
                        "第一波 {} 个条目全部因网络类错误失败，判定服务不可达",
                        summary.failed
                    ),
                })?;
            }
            task.apply(&TaskEvent::StageFinished { stage })?;
            self.persistence.flush(&task);
            task.clone()
        };

        if summary.was_cancelled {
            warn!("⛔ 阶段「{}」已取消: {}", stage, summary);
        } else {
            info!("✓ 阶段「{}」结束: {}", stage, summary);
        }

        let mut export_path = None;
        if stage == Stage::Export && !summary.was_cancelled && !summary.unreachable {
            export_path = self.finalize_export(&task_snapshot).await;
        }

        Ok(StageReport {
            stage,
            scheduled: summary.total(),
            completed: summary.completed,
            failed: summary.failed,
            cancelled: summary.cancelled,
            not_scheduled: summary.not_scheduled,
            waves_run: summary.waves_run,
            total_waves: summary.total_waves,
            was_cancelled: summary.was_cancelled,
            batch_failed: task_snapshot.status == TaskStatus::Failed,
            counts: task_snapshot.counts(stage),
            progress: self.progress.snapshot(),
            export_path,
        })
    }

    /// 按运行方式重置状态并挑选条目
    fn prepare(
        &self,
        stage: Stage,
        mode: &RunMode,
    ) -> AppResult<(Vec<Scheduled>, Vec<Arc<ItemInput>>, usize)> {
        let mut task = self.lock_task()?;
        match mode {
            RunMode::RetryFailed => task.apply(&TaskEvent::StageReset {
                stage,
                only_failed: true,
            })?,
            RunMode::RetryAll => task.apply(&TaskEvent::StageReset {
                stage,
                only_failed: false,
            })?,
            RunMode::Resume | RunMode::Rerun(_) => {}
        }
        task.apply(&TaskEvent::StageStarted { stage })?;

        let rerun_ids: &[String] = match mode {
            RunMode::Rerun(ids) => ids,
            _ => &[],
        };
        let eligible = task.eligible(stage, rerun_ids);
        let skipped = task.items.len() - eligible.len();
        if skipped > 0 {
            debug!("阶段「{}」跳过 {} 个已完成或未就绪的条目", stage, skipped);
        }

        let config = Arc::new(task.config.clone());
        let mut scheduled = Vec::with_capacity(eligible.len());
        let mut inputs = Vec::with_capacity(eligible.len());
        for index in eligible {
            let item = &task.items[index];
            scheduled.push(Scheduled {
                item_id: item.id.clone(),
                rerun: item.status(stage) == ItemStatus::Completed,
            });
            inputs.push(Arc::new(ItemInput {
                ctx: ItemCtx::new(
                    task.id.clone(),
                    item.id.clone(),
                    index + 1,
                    item.label().to_string(),
                ),
                item: item.clone(),
                config: config.clone(),
            }));
        }
        Ok((scheduled, inputs, task.items.len()))
    }

    /// 写出导出汇总；全部条目都已走完时删除快照
    async fn finalize_export(&self, task: &Task) -> Option<String> {
        let exported = task.counts(Stage::Export).completed;
        if exported == 0 {
            warn!("⚠️ 没有可导出的条目");
            return None;
        }
        match self.flow.exporter().finalize(task).await {
            Ok(path) => {
                if task.is_settled() {
                    self.persistence.clear(&task.id);
                    info!("🧹 任务已全部导出，快照已删除");
                }
                Some(path)
            }
            Err(e) => {
                error!("❌ 写出导出汇总失败: {}", e);
                None
            }
        }
    }
}

/// 把调度器的回调翻译成任务事件
struct StageObserver<'a> {
    stage: Stage,
    task: &'a Mutex<Task>,
    progress: &'a ProgressAggregator,
    persistence: &'a PersistenceManager,
    scheduled: &'a [Scheduled],
    wave_range: Range<usize>,
    wave_success: usize,
    // 没能进入 Processing 的条目下标
    rejected: HashSet<usize>,
    // 第一个写回错误，调度结束后返回给调用方
    error: Option<AppError>,
}

impl StageObserver<'_> {
    fn with_task<R>(&mut self, f: impl FnOnce(&mut Task) -> AppResult<R>) -> Option<R> {
        let result = match self.task.lock() {
            Ok(mut task) => f(&mut task),
            Err(e) => Err(AppError::misuse(format!("任务锁已损坏: {}", e))),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                if self.error.is_none() {
                    self.error = Some(e);
                }
                None
            }
        }
    }
}

impl WaveObserver<StageOutput> for StageObserver<'_> {
    fn on_wave_start(&mut self, wave: usize, total_waves: usize, indices: Range<usize>) {
        let stage = self.stage;
        let scheduled = self.scheduled;
        let mut rejected = Vec::new();
        // 逐个条目开始；被拒绝的条目单独隔离，不影响同波次的其他条目
        let started = self.with_task(|task| {
            for index in indices.clone() {
                let s = &scheduled[index];
                let event = TaskEvent::ItemStarted {
                    item_id: s.item_id.clone(),
                    stage,
                    rerun: s.rerun,
                };
                if let Err(e) = task.apply(&event) {
                    warn!("[条目 {}] ⚠️ 无法开始{}，本次结果将被忽略: {}", s.item_id, stage, e);
                    rejected.push(index);
                }
            }
            Ok(())
        });
        if started.is_none() {
            rejected.extend(indices.clone());
        }
        self.rejected.extend(rejected);
        logging::log_wave_start(
            wave + 1,
            total_waves,
            indices.start + 1,
            indices.end,
            self.scheduled.len(),
        );
        self.wave_range = indices;
        self.wave_success = 0;
        self.progress.begin_wave(wave);
    }

    fn on_settled(&mut self, index: usize, outcome: &ItemOutcome<StageOutput>, attempts: u32) {
        let stage = self.stage;
        if self.rejected.contains(&index) {
            debug!("[条目 {}] 未能开始{}，忽略结算结果", self.scheduled[index].item_id, stage);
            return;
        }
        let item_id = self.scheduled[index].item_id.clone();
        let (event, success) = match outcome {
            ItemOutcome::Completed(output) => (
                TaskEvent::ItemSucceeded {
                    item_id: item_id.clone(),
                    stage,
                    output: output.clone(),
                    attempts,
                },
                Some(true),
            ),
            ItemOutcome::Failed(e) => {
                warn!("[条目 {}] ❌ {}失败 (尝试 {} 次): {}", item_id, stage, attempts, e);
                (
                    TaskEvent::ItemFailed {
                        item_id: item_id.clone(),
                        stage,
                        error: e.to_string(),
                        attempts,
                    },
                    Some(false),
                )
            }
            ItemOutcome::Cancelled | ItemOutcome::NotScheduled => (
                TaskEvent::ItemReset {
                    item_id: item_id.clone(),
                    stage,
                },
                None,
            ),
        };

        let label = self.with_task(|task| {
            task.apply(&event)?;
            Ok(task
                .item(&item_id)
                .map(|item| item.label().to_string())
                .unwrap_or_else(|| item_id.clone()))
        });

        if let (Some(success), Some(label)) = (success, label) {
            if success {
                self.wave_success += 1;
            }
            let snapshot = self.progress.on_item_settled(&label, success, Utc::now());
            debug!("{}", snapshot.status_line());
        }
    }

    fn on_wave_complete(&mut self, wave: usize, _total_waves: usize) {
        logging::log_wave_complete(wave + 1, self.wave_success, self.wave_range.len());
        let persistence = self.persistence;
        self.with_task(|task| {
            persistence.save_if_due(task);
            Ok(())
        });
    }
}
