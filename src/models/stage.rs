use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// 流水线阶段枚举（按执行顺序排列）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// 导入扫描件
    Ingest,
    /// 手写识别
    Recognize,
    /// 内容确认
    Confirm,
    /// 学生身份匹配
    ResolveIdentity,
    /// AI 评分
    Grade,
    /// 导出
    Export,
}

impl Stage {
    /// 全部阶段，按执行顺序
    pub const ALL: [Stage; 6] = [
        Stage::Ingest,
        Stage::Recognize,
        Stage::Confirm,
        Stage::ResolveIdentity,
        Stage::Grade,
        Stage::Export,
    ];

    /// 命令行 / 配置里使用的名称
    pub fn name(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Recognize => "recognize",
            Stage::Confirm => "confirm",
            Stage::ResolveIdentity => "resolve-identity",
            Stage::Grade => "grade",
            Stage::Export => "export",
        }
    }

    /// 日志里使用的中文名称
    pub fn label(self) -> &'static str {
        match self {
            Stage::Ingest => "导入",
            Stage::Recognize => "识别",
            Stage::Confirm => "确认",
            Stage::ResolveIdentity => "身份匹配",
            Stage::Grade => "评分",
            Stage::Export => "导出",
        }
    }

    /// 本阶段直接使用其产出的阶段；条目只有在这些阶段都完成后才会被本阶段处理
    pub fn inputs(self) -> &'static [Stage] {
        match self {
            Stage::Ingest => &[],
            Stage::Recognize => &[Stage::Ingest],
            Stage::Confirm => &[Stage::Recognize],
            Stage::ResolveIdentity => &[Stage::Confirm],
            Stage::Grade => &[Stage::Confirm],
            Stage::Export => &[Stage::ResolveIdentity, Stage::Grade],
        }
    }

    /// `self` 是否直接或间接使用 `other` 的产出
    pub fn depends_on(self, other: Stage) -> bool {
        self.inputs()
            .iter()
            .any(|input| *input == other || input.depends_on(other))
    }

    /// 从第一个阶段到 `self`（含）的所有阶段
    pub fn up_to(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| *s <= self)
    }

    /// 在 `self` 之后的所有阶段
    pub fn downstream(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| *s > self)
    }
}

impl std::str::FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "ingest" | "导入" => Ok(Stage::Ingest),
            "recognize" | "ocr" | "识别" => Ok(Stage::Recognize),
            "confirm" | "确认" => Ok(Stage::Confirm),
            "resolve-identity" | "identity" | "身份匹配" => Ok(Stage::ResolveIdentity),
            "grade" | "评分" => Ok(Stage::Grade),
            "export" | "导出" => Ok(Stage::Export),
            other => Err(ConfigError::InvalidValue {
                field: "stage".to_string(),
                reason: format!("未知阶段: {}", other),
            }),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
