//! 批量批改处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是命令行应用的入口，负责组装各层并运行流水线。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：加载输入目录、打开状态目录、恢复或新建任务
//! 2. **能力组装**：按配置选择识别、评分、导出实现
//! 3. **运行**：从第一个阶段运行到目标阶段
//! 4. **全局统计**：汇总结果并给出退出码

use crate::config::Config;
use crate::error::{AppError, AppResult, OperationError};
use crate::models::{load_batch_input, BatchInput, ItemStatus, Stage, Task};
use crate::orchestrator::cancel::CancellationController;
use crate::orchestrator::pipeline::{Pipeline, PipelineOptions, RunMode, StageReport};
use crate::persistence::{FileStore, PersistenceManager, Snapshot, SnapshotTier};
use crate::services::{recognizer, JsonExporter, LlmGrader, LlmService};
use crate::utils::logging::{log_items_loaded, log_startup, print_final_stats};
use crate::workflow::ItemFlow;
use std::sync::Arc;
use tracing::{info, warn};

/// 命令行运行参数
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input_dir: String,
    pub target: Stage,
    pub mode: RunMode,
    /// 指定要恢复的任务；不指定时按输入目录查找最近的快照
    pub task_id: Option<String>,
}

/// 一次运行的结果
#[derive(Debug)]
pub struct RunOutcome {
    pub task: Task,
    pub reports: Vec<StageReport>,
}

impl RunOutcome {
    pub fn was_cancelled(&self) -> bool {
        self.reports.iter().any(|r| r.was_cancelled)
    }

    /// 在目标阶段之前失败的条目数
    pub fn failed_items(&self) -> usize {
        let target = self.task.target_stage;
        self.task
            .items
            .iter()
            .filter(|item| {
                target
                    .up_to()
                    .any(|stage| item.status(stage) == ItemStatus::Failed)
            })
            .count()
    }

    /// 进程退出码：0 全部完成，2 有条目失败，130 被取消
    pub fn exit_code(&self) -> i32 {
        if self.was_cancelled() {
            130
        } else if self.failed_items() > 0 {
            2
        } else {
            0
        }
    }
}

/// 应用主结构
pub struct App {
    config: Config,
    options: RunOptions,
    pipeline: Pipeline,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config, options: RunOptions) -> AppResult<Self> {
        config.validate()?;
        log_startup(config.concurrency, options.target);

        info!("\n📁 正在扫描待处理的扫描件...");
        let input = load_batch_input(&options.input_dir).await?;
        log_items_loaded(input.items.len(), config.concurrency);

        let store = FileStore::open(&config.state_dir, config.storage_capacity_bytes)?;
        let persistence = Arc::new(PersistenceManager::from_config(Arc::new(store), &config));

        let task = Self::restore_or_create(&persistence, &options, input)?;

        let llm = LlmService::new(&config, &config.llm_model_name);
        let recognizer = recognizer::from_config(&config).map_err(OperationError::from)?;
        let flow = ItemFlow::new(
            recognizer,
            Box::new(LlmGrader::new(llm)),
            Arc::new(JsonExporter::new(&config.output_dir)),
        );
        let pipeline = Pipeline::new(
            task,
            Arc::new(flow),
            persistence,
            PipelineOptions::from_config(&config),
        );

        Ok(Self {
            config,
            options,
            pipeline,
        })
    }

    /// 恢复已有任务，找不到时新建
    fn restore_or_create(
        persistence: &PersistenceManager,
        options: &RunOptions,
        input: BatchInput,
    ) -> AppResult<Task> {
        let snapshot = match &options.task_id {
            Some(id) => Some(persistence.load(id).ok_or_else(|| {
                AppError::Other(format!("找不到任务 {} 的快照", id))
            })?),
            None => Self::find_snapshot_for(persistence, &input),
        };

        let Some(snapshot) = snapshot else {
            let task = Task::new(input.title, input.config, input.items);
            info!("🆕 新建任务 {} ({} 份)", task.id, task.items.len());
            return Ok(task);
        };

        let tier = snapshot.tier;
        let mut task = snapshot.into_task();
        if tier == SnapshotTier::Minimal {
            task.config = input.config.clone();
        }
        let restored = task.rehydrate_sources(&input.items);
        if restored > 0 {
            info!("🔗 已从输入目录补全 {} 份扫描件", restored);
        }
        let missing = input
            .items
            .iter()
            .filter(|fresh| task.item(&fresh.id).is_none())
            .count();
        if missing > 0 {
            warn!("⚠️ 输入目录中有 {} 份扫描件不在原任务中，本次忽略", missing);
        }
        info!("♻️  恢复任务 {} ({}档快照)", task.id, tier);
        Ok(task)
    }

    /// 按输入目录查找最近的快照
    fn find_snapshot_for(persistence: &PersistenceManager, input: &BatchInput) -> Option<Snapshot> {
        let source_dir = input.config.source_dir.as_deref()?;
        let mut headers = persistence.list_snapshots();
        headers.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        headers
            .iter()
            .filter_map(|header| persistence.load(&header.task_id))
            .find(|snapshot| {
                snapshot
                    .config
                    .as_ref()
                    .and_then(|c| c.source_dir.as_deref())
                    == Some(source_dir)
            })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// 运行应用主逻辑
    pub async fn run(&self, cancel: &CancellationController) -> AppResult<RunOutcome> {
        let task = self.pipeline.task()?;
        if task.items.is_empty() {
            warn!("⚠️ 没有找到待处理的扫描件，程序结束");
            return Ok(RunOutcome {
                task,
                reports: Vec::new(),
            });
        }

        let reports = self
            .pipeline
            .run_through(self.options.target, self.options.mode.clone(), cancel)
            .await?;
        let task = self.pipeline.task()?;

        if let Some(last) = reports.last() {
            print_final_stats(
                last.stage,
                &task.counts(last.stage),
                reports.iter().find_map(|r| r.export_path.as_deref()),
            );
        }
        if self.config.verbose_logging {
            for report in &reports {
                info!("{}", report);
            }
        }

        Ok(RunOutcome { task, reports })
    }
}
