//! # Essay Batch
//!
//! 批量批改手写作文扫描件的流水线引擎
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 模型层（Models）
//! - `models/` - 任务、条目、阶段，以及唯一的状态变更入口 `Task::apply`
//! - `loaders` - 扫描输入目录，读取 `task.toml`
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单份作文
//! - `Recognizer` - 手写识别（视觉大模型 / HTTP OCR）
//! - `Grader` - LLM 评分
//! - `IdentityResolver` - 花名册匹配
//! - `Exporter` - 写出结果
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一份作文在某个阶段"要做的事
//! - `ItemCtx` - 上下文封装（task_id + 条目位置）
//! - `ItemFlow` - 按阶段分派到对应能力
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/scheduler` - 波次调度，限制并发
//! - `orchestrator/retry` - 指数退避重试
//! - `orchestrator/pipeline` - 阶段流水线，写回任务状态
//! - `orchestrator/batch_processor` - 命令行应用入口
//!
//! ### ⑤ 持久化（Persistence）
//! - `persistence/` - 分档快照，超出存储预算时逐级降档
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, OperationError};
pub use models::{Item, ItemStatus, Stage, Task, TaskEvent, TaskStatus};
pub use orchestrator::{App, CancellationController, Pipeline, RunMode, RunOptions};
pub use persistence::{PersistenceManager, Snapshot, SnapshotTier};
pub use workflow::{ItemCtx, ItemFlow};
