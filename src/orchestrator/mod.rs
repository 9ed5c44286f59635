//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量调度和状态管理，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 应用入口
//! - 加载输入目录，恢复或新建任务
//! - 组装识别、评分、导出能力
//! - 输出全局统计信息和退出码
//!
//! ### `pipeline` - 阶段流水线
//! - 按运行方式挑选条目（续跑 / 重试失败 / 全部重试 / 指定重跑）
//! - 把调度结果写回唯一的任务状态
//! - 每个波次后自动保存快照
//!
//! ### `scheduler` - 波次调度器
//! - 按并发数切分波次，波次内并发，波次间等待
//! - 单个条目失败（包括 panic）不影响其他条目
//!
//! ### `retry` / `cancel` / `progress`
//! - 统一的重试退避策略
//! - 协作式取消
//! - 原子计数的进度汇总
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理一个输入目录)
//!     ↓
//! pipeline (处理一个阶段的 Vec<Item>)
//!     ↓
//! scheduler + retry (处理一个波次)
//!     ↓
//! workflow::ItemFlow (处理单个条目的单个阶段)
//!     ↓
//! services (能力层：recognizer / grader / identity / exporter)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一状态**：任务只有一份，所有修改都经过 `Task::apply`
//! 2. **失败隔离**：条目错误只记录在条目上
//! 3. **向下依赖**：编排层 → workflow → services
//! 4. **无业务逻辑**：只做调度和统计，不做具体业务判断

pub mod batch_processor;
pub mod cancel;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod scheduler;

// 重新导出主要类型
pub use batch_processor::{App, RunOptions, RunOutcome};
pub use cancel::CancellationController;
pub use pipeline::{Pipeline, PipelineOptions, RunMode, StageReport};
pub use progress::{ProgressAggregator, ProgressSnapshot};
pub use retry::{with_retry, RetryOutcome, RetryPolicy};
pub use scheduler::{run_stage, ItemOutcome, StageRunSummary, WaveObserver, WaveOptions};
