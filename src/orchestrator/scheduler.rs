//! 波次调度器
//!
//! 把条目按 `concurrency` 切成若干波次：同一波次内的操作并发执行，
//! 等整波全部结算（成功或失败都算）后，间隔 `inter_wave_delay` 再开始下一波。
//! 单个条目的失败只记录为该条目的结果，不会中断波次。

use crate::config::Config;
use crate::error::{AppError, AppResult, OperationError};
use crate::orchestrator::cancel::CancellationController;
use crate::orchestrator::retry::RetryOutcome;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// 允许的最大并发数
pub const MAX_CONCURRENCY: usize = 64;

/// 波次参数
#[derive(Debug, Clone, PartialEq)]
pub struct WaveOptions {
    /// 每个波次的条目数，同时也是并发上限
    pub concurrency: usize,
    /// 波次之间的固定间隔，用来避开外部服务的限流
    pub inter_wave_delay: Duration,
    /// 第一波全部因网络类错误失败时，判定整批不可达并停止调度
    pub abort_on_unreachable: bool,
}

impl Default for WaveOptions {
    fn default() -> Self {
        Self {
            concurrency: 20,
            inter_wave_delay: Duration::from_millis(500),
            abort_on_unreachable: true,
        }
    }
}

impl WaveOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            inter_wave_delay: Duration::from_millis(config.inter_wave_delay_ms),
            abort_on_unreachable: true,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(AppError::misuse(format!(
                "并发数必须在 1..={} 之间，当前为 {}",
                MAX_CONCURRENCY, self.concurrency
            )));
        }
        Ok(())
    }

    pub fn total_waves(&self, total_items: usize) -> usize {
        if self.concurrency == 0 {
            return 0;
        }
        (total_items + self.concurrency - 1) / self.concurrency
    }
}

/// 单个条目的结算结果
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<O> {
    Completed(O),
    Failed(OperationError),
    /// 运行被取消，结果被丢弃，条目应回到 Pending
    Cancelled,
    /// 取消或批次不可达导致根本没有调度
    NotScheduled,
}

impl<O> ItemOutcome<O> {
    pub fn is_completed(&self) -> bool {
        matches!(self, ItemOutcome::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed(_))
    }
}

/// 调度过程的观察者，调度器在自己的任务上按结算顺序依次回调
pub trait WaveObserver<O> {
    fn on_wave_start(&mut self, _wave: usize, _total_waves: usize, _indices: Range<usize>) {}

    fn on_settled(&mut self, _index: usize, _outcome: &ItemOutcome<O>, _attempts: u32) {}

    fn on_wave_complete(&mut self, _wave: usize, _total_waves: usize) {}
}

impl<O> WaveObserver<O> for () {}

/// 一次阶段运行的汇总
#[derive(Debug)]
pub struct StageRunSummary<O> {
    /// 与输入条目一一对应
    pub outcomes: Vec<ItemOutcome<O>>,
    pub attempts: Vec<u32>,
    pub waves_run: usize,
    pub total_waves: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_scheduled: usize,
    pub was_cancelled: bool,
    /// 第一波全部不可达，剩余波次未调度
    pub unreachable: bool,
}

impl<O> StageRunSummary<O> {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }
}

impl<O> std::fmt::Display for StageRunSummary<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "波次: {}/{}, 成功: {}, 失败: {}, 取消: {}, 未调度: {}, 总计: {}",
            self.waves_run,
            self.total_waves,
            self.completed,
            self.failed,
            self.cancelled,
            self.not_scheduled,
            self.total()
        )
    }
}

/// 按波次运行一个阶段
///
/// `operation` 在调度器任务上被调用以生成 future，future 会被派发到独立的 tokio 任务中执行。
/// 操作内部 panic 也会被捕获为该条目的失败。
pub async fn run_stage<I, O, F, Fut, W>(
    items: Vec<I>,
    mut operation: F,
    options: &WaveOptions,
    cancel: &CancellationController,
    observer: &mut W,
) -> AppResult<StageRunSummary<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(I) -> Fut,
    Fut: Future<Output = RetryOutcome<O>> + Send + 'static,
    W: WaveObserver<O>,
{
    options.validate()?;

    let total = items.len();
    let total_waves = options.total_waves(total);
    let mut outcomes: Vec<Option<ItemOutcome<O>>> = (0..total).map(|_| None).collect();
    let mut attempts = vec![0u32; total];
    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let mut pending_items = items.into_iter();
    let mut waves_run = 0;
    let mut unreachable = false;

    for wave in 0..total_waves {
        if cancel.is_cancelled() {
            info!("运行已取消，跳过剩余 {} 个波次", total_waves - wave);
            break;
        }

        if wave > 0 && !options.inter_wave_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(options.inter_wave_delay) => {}
                _ = cancel.cancelled() => {
                    info!("波次间隔中收到取消，跳过剩余 {} 个波次", total_waves - wave);
                    break;
                }
            }
        }

        let start = wave * options.concurrency;
        let end = (start + options.concurrency).min(total);
        observer.on_wave_start(wave, total_waves, start..end);

        let mut join_set = JoinSet::new();
        for index in start..end {
            let Some(item) = pending_items.next() else {
                break;
            };
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::misuse(format!("并发信号量已关闭: {}", e)))?;
            let fut = operation(item);
            join_set.spawn(async move {
                let _permit = permit;
                let caught = AssertUnwindSafe(fut).catch_unwind().await;
                (index, caught)
            });
        }
        waves_run += 1;

        // 容错汇合：逐个等待结算，任何一个失败都不会提前结束本波
        while let Some(joined) = join_set.join_next().await {
            let (index, caught) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!("波次 {} 中的任务异常退出: {}", wave + 1, e);
                    continue;
                }
            };

            let (outcome, tries) = match caught {
                Ok(RetryOutcome { result, attempts }) => {
                    let outcome = if cancel.is_cancelled() {
                        ItemOutcome::Cancelled
                    } else {
                        match result {
                            Ok(value) => ItemOutcome::Completed(value),
                            Err(e) if e.is_cancelled() => ItemOutcome::Cancelled,
                            Err(e) => ItemOutcome::Failed(e),
                        }
                    };
                    (outcome, attempts)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("条目 {} 的操作 panic: {}", index + 1, message);
                    (
                        ItemOutcome::Failed(OperationError::permanent(format!(
                            "操作异常终止: {}",
                            message
                        ))),
                        1,
                    )
                }
            };

            observer.on_settled(index, &outcome, tries);
            attempts[index] = tries;
            outcomes[index] = Some(outcome);
        }

        for index in start..end {
            if outcomes[index].is_none() {
                let outcome = ItemOutcome::Failed(OperationError::permanent("任务异常退出"));
                observer.on_settled(index, &outcome, 1);
                outcomes[index] = Some(outcome);
            }
        }

        observer.on_wave_complete(wave, total_waves);

        if wave == 0 && options.abort_on_unreachable && !cancel.is_cancelled() {
            let first_wave = &outcomes[start..end];
            let any_completed = first_wave
                .iter()
                .any(|o| matches!(o, Some(ItemOutcome::Completed(_))));
            let failures: Vec<&OperationError> = first_wave
                .iter()
                .filter_map(|o| match o {
                    Some(ItemOutcome::Failed(e)) => Some(e),
                    _ => None,
                })
                .collect();
            if !any_completed && !failures.is_empty() && failures.iter().all(|e| e.is_retryable())
            {
                warn!(
                    "第一波 {} 个条目全部因网络类错误失败，判定批次不可达，停止调度",
                    failures.len()
                );
                unreachable = true;
                break;
            }
        }
    }

    let outcomes: Vec<ItemOutcome<O>> = outcomes
        .into_iter()
        .map(|o| o.unwrap_or(ItemOutcome::NotScheduled))
        .collect();

    let mut summary = StageRunSummary {
        completed: 0,
        failed: 0,
        cancelled: 0,
        not_scheduled: 0,
        waves_run,
        total_waves,
        was_cancelled: cancel.is_cancelled(),
        unreachable,
        attempts,
        outcomes: Vec::new(),
    };
    for outcome in &outcomes {
        match outcome {
            ItemOutcome::Completed(_) => summary.completed += 1,
            ItemOutcome::Failed(_) => summary.failed += 1,
            ItemOutcome::Cancelled => summary.cancelled += 1,
            ItemOutcome::NotScheduled => summary.not_scheduled += 1,
        }
    }
    summary.outcomes = outcomes;

    Ok(summary)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}
