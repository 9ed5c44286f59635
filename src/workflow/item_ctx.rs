//! 条目处理上下文
//!
//! 封装"我正在处理哪个任务的第几份作文"这一信息

use std::fmt::Display;

/// 条目处理上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemCtx {
    /// 任务ID
    pub task_id: String,

    /// 条目ID
    pub item_id: String,

    /// 条目在任务中的位置（从1开始，仅用于日志显示）
    pub position: usize,

    /// 显示名（学生名或文件名）
    pub label: String,
}

impl ItemCtx {
    /// 创建新的条目上下文
    pub fn new(task_id: String, item_id: String, position: usize, label: String) -> Self {
        Self {
            task_id,
            item_id,
            position,
            label,
        }
    }
}

impl Display for ItemCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[条目 #{} {}]", self.position, self.label)
    }
}
