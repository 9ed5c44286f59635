//! 重试控制
//!
//! 所有调用点共用一套策略：最多 `max_retries` 次重试，指数退避 `base × 2^attempt`，
//! 上限 `max_backoff`。每次尝试都有独立超时，超时按临时错误处理。

use crate::config::Config;
use crate::error::OperationError;
use crate::orchestrator::cancel::CancellationController;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// 单次调用超时
    pub timeout: Duration,
    /// 取消时是否立即中断进行中的调用；不可中断的调用会跑完，但结果会被丢弃
    pub abort_on_cancel: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
            abort_on_cancel: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Duration::from_secs(config.operation_timeout_secs),
            abort_on_cancel: true,
        }
    }

    pub fn with_abort_on_cancel(mut self, abort: bool) -> Self {
        self.abort_on_cancel = abort;
        self
    }

    /// 第 `attempt` 次失败后的等待时间（attempt 从 0 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// 重试结果：最终结果 + 实际尝试次数
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, OperationError>,
    pub attempts: u32,
}

/// 带重试执行一个操作
///
/// `op` 的参数是当前尝试序号（从 0 开始）。每次尝试前、每次等待中都会检查取消信号，
/// 一旦取消立即返回 [`OperationError::Cancelled`]。
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    cancel: &CancellationController,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, OperationError>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(OperationError::Cancelled),
                attempts: attempt,
            };
        }

        let call = tokio::time::timeout(policy.timeout, op(attempt));
        let result = if policy.abort_on_cancel {
            tokio::select! {
                r = call => r,
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(OperationError::Cancelled),
                        attempts: attempt + 1,
                    };
                }
            }
        } else {
            call.await
        };
        let result = result.unwrap_or(Err(OperationError::Timeout(policy.timeout)));
        attempt += 1;

        let err = match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        if !err.is_retryable() || attempt > policy.max_retries {
            if err.is_retryable() {
                warn!("操作在 {} 次尝试后仍失败: {}", attempt, err);
            }
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.backoff(attempt - 1);
        debug!("第 {} 次尝试失败: {}，{:?} 后重试", attempt, err, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(OperationError::Cancelled),
                    attempts: attempt,
                };
            }
        }
    }
}
