//! 条目处理流程 - 流程层
//!
//! 核心职责：定义"一份作文在某个阶段"要做的事
//!
//! 阶段顺序：
//! 1. 导入：读取扫描件
//! 2. 识别：手写转文本
//! 3. 确认：采用用户修改后的文本或识别原文
//! 4. 身份匹配：按花名册找作者
//! 5. 评分：LLM 打分、写评语
//! 6. 导出：写出结果文件

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::OperationError;
use crate::models::{Item, Stage, StageOutput, TaskConfig};
use crate::services::{ExportRecord, Exporter, Grader, IdentityResolver, Recognizer};
use crate::utils::logging::truncate_text;
use crate::workflow::item_ctx::ItemCtx;

/// 一次阶段操作的输入
///
/// 从任务中拷贝出来，操作期间不持有任务锁
#[derive(Debug, Clone)]
pub struct ItemInput {
    pub ctx: ItemCtx,
    pub item: Item,
    pub config: Arc<TaskConfig>,
}

/// 条目处理流程
///
/// - 只处理单个条目的单个阶段
/// - 不关心波次、重试和持久化
/// - 只依赖业务能力（services）
pub struct ItemFlow {
    recognizer: Box<dyn Recognizer>,
    grader: Box<dyn Grader>,
    exporter: Arc<dyn Exporter>,
}

impl ItemFlow {
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        grader: Box<dyn Grader>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        Self {
            recognizer,
            grader,
            exporter,
        }
    }

    pub fn exporter(&self) -> &Arc<dyn Exporter> {
        &self.exporter
    }

    /// 取消时能否直接中断；写文件的导出阶段会跑完，只是结果被丢弃
    pub fn abortable(stage: Stage) -> bool {
        stage != Stage::Export
    }

    pub async fn run(&self, stage: Stage, input: &ItemInput) -> Result<StageOutput, OperationError> {
        let ctx = &input.ctx;
        let item = &input.item;
        debug!("{} ▶ {}", ctx, stage);

        match stage {
            Stage::Ingest => self.ingest(ctx, item).await,
            Stage::Recognize => self.recognize(ctx, item).await,
            Stage::Confirm => Self::confirm(ctx, item),
            Stage::ResolveIdentity => Ok(Self::resolve_identity(ctx, item, &input.config)),
            Stage::Grade => self.grade(ctx, item, &input.config).await,
            Stage::Export => self.export(ctx, item).await,
        }
    }

    async fn ingest(&self, ctx: &ItemCtx, item: &Item) -> Result<StageOutput, OperationError> {
        if let Some(image) = &item.source.image {
            if image.is_empty() {
                return Err(OperationError::permanent(format!("{} 图片为空", ctx)));
            }
            return Ok(StageOutput::Ingested {
                image: None,
                size_bytes: image.len() as u64,
            });
        }
        let bytes = read_source(item).await?;
        info!("{} 📥 已读取 {} 字节", ctx, bytes.len());
        Ok(StageOutput::Ingested {
            size_bytes: bytes.len() as u64,
            image: Some(bytes),
        })
    }

    async fn recognize(&self, ctx: &ItemCtx, item: &Item) -> Result<StageOutput, OperationError> {
        let loaded;
        let image: &[u8] = match &item.source.image {
            Some(bytes) => bytes,
            None => {
                loaded = read_source(item).await?;
                &loaded
            }
        };
        let recognition = self.recognizer.recognize(image, &item.source.mime).await?;
        info!(
            "{} 🔍 识别完成 (置信度 {:.2}): {}",
            ctx,
            recognition.confidence,
            truncate_text(&recognition.text, 30)
        );
        Ok(StageOutput::Recognized(recognition))
    }

    fn confirm(ctx: &ItemCtx, item: &Item) -> Result<StageOutput, OperationError> {
        let text = item.current_text().map(str::trim).unwrap_or_default();
        if text.is_empty() {
            warn!("{} ⚠️ 没有可确认的文本", ctx);
            return Err(OperationError::permanent("识别结果为空，需要人工录入"));
        }
        Ok(StageOutput::Confirmed {
            text: text.to_string(),
        })
    }

    fn resolve_identity(ctx: &ItemCtx, item: &Item, config: &TaskConfig) -> StageOutput {
        let text = item
            .confirmed_text
            .as_deref()
            .or_else(|| item.current_text())
            .unwrap_or_default();
        let identity = IdentityResolver::new(config.roster.clone()).resolve(text);
        if identity.matched {
            info!("{} 👤 匹配到学生: {}", ctx, identity.student);
        } else {
            warn!("{} ⚠️ 未在花名册中找到作者，记为 {}", ctx, identity.student);
        }
        StageOutput::Identified(identity)
    }

    async fn grade(
        &self,
        ctx: &ItemCtx,
        item: &Item,
        config: &TaskConfig,
    ) -> Result<StageOutput, OperationError> {
        let text = item
            .confirmed_text
            .as_deref()
            .ok_or_else(|| OperationError::permanent("文本尚未确认"))?;
        let grade = self.grader.grade(text, &config.grading).await?;
        info!("{} ✍️ 评分完成: {}/{}", ctx, grade.score, config.grading.max_score);
        Ok(StageOutput::Graded(grade))
    }

    async fn export(&self, ctx: &ItemCtx, item: &Item) -> Result<StageOutput, OperationError> {
        let record = ExportRecord::from_item(item)?;
        let path = self.exporter.export_item(&ctx.task_id, &record).await?;
        debug!("{} 已导出至 {}", ctx, path);
        Ok(StageOutput::Exported { path })
    }
}

/// 从磁盘读取扫描件
async fn read_source(item: &Item) -> Result<Vec<u8>, OperationError> {
    let path = item.source.path.as_deref().ok_or_else(|| {
        OperationError::permanent(format!("条目 {} 的扫描件已丢失，需要重新导入", item.id))
    })?;
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            OperationError::permanent(format!("读取 {} 失败: {}", path, e))
        }
        _ => OperationError::transient(format!("读取 {} 失败: {}", path, e)),
    })?;
    if bytes.is_empty() {
        return Err(OperationError::permanent(format!("{} 是空文件", path)));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppResult;
    use crate::models::{GradeResult, GradingContext, Recognition, SourceRef, Task};
    use async_trait::async_trait;

    struct EchoRecognizer;

    #[async_trait]
    impl Recognizer for EchoRecognizer {
        async fn recognize(&self, image: &[u8], _mime: &str) -> Result<Recognition, OperationError> {
            Ok(Recognition {
                text: String::from_utf8_lossy(image).to_string(),
                confidence: 0.9,
            })
        }
    }

    struct LengthGrader;

    #[async_trait]
    impl Grader for LengthGrader {
        async fn grade(&self, text: &str, _: &GradingContext) -> Result<GradeResult, OperationError> {
            Ok(GradeResult {
                score: text.chars().count() as f64,
                feedback: "ok".into(),
                improved: text.into(),
            })
        }
    }

    struct NullExporter;

    #[async_trait]
    impl Exporter for NullExporter {
        async fn export_item(&self, task_id: &str, record: &ExportRecord) -> Result<String, OperationError> {
            Ok(format!("{}/{}", task_id, record.item_id))
        }

        async fn finalize(&self, task: &Task) -> AppResult<String> {
            Ok(task.id.clone())
        }
    }

    fn flow() -> ItemFlow {
        ItemFlow::new(Box::new(EchoRecognizer), Box::new(LengthGrader), Arc::new(NullExporter))
    }

    fn input(item: Item) -> ItemInput {
        ItemInput {
            ctx: ItemCtx::new("t".into(), item.id.clone(), 1, item.source.file_name.clone()),
            item,
            config: Arc::new(TaskConfig {
                roster: vec!["李雷".into()],
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_ingest_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"pixels").unwrap();
        let item = Item::new("a", SourceRef::from_path(path.display().to_string(), "a.png", 6));

        let output = flow().run(Stage::Ingest, &input(item)).await.unwrap();
        assert_eq!(
            output,
            StageOutput::Ingested {
                image: Some(b"pixels".to_vec()),
                size_bytes: 6
            }
        );
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let item = Item::new("gone", SourceRef::placeholder("gone.png", 10));
        let err = flow().run(Stage::Ingest, &input(item)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_recognize_then_confirm_prefers_edit() {
        let mut item = Item::new("a", SourceRef::inline("a.png", "姓名：李雷\n春天".as_bytes().to_vec()));
        let output = flow().run(Stage::Recognize, &input(item.clone())).await.unwrap();
        let StageOutput::Recognized(recognition) = output else {
            panic!("应为识别结果");
        };
        item.extracted = Some(recognition);

        let output = flow().run(Stage::Confirm, &input(item.clone())).await.unwrap();
        assert_eq!(
            output,
            StageOutput::Confirmed {
                text: "姓名：李雷\n春天".into()
            }
        );

        item.edited_text = Some("  修改稿  ".into());
        let output = flow().run(Stage::Confirm, &input(item)).await.unwrap();
        assert_eq!(output, StageOutput::Confirmed { text: "修改稿".into() });
    }

    #[tokio::test]
    async fn test_confirm_empty_text_fails_permanently() {
        let mut item = Item::new("a", SourceRef::inline("a.png", vec![1]));
        item.extracted = Some(Recognition {
            text: "   ".into(),
            confidence: 0.1,
        });
        let err = flow().run(Stage::Confirm, &input(item)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_identity_grade_export_chain() {
        let mut item = Item::new("a", SourceRef::inline("a.png", vec![1]));
        item.confirmed_text = Some("姓名：李雷\n春天".into());

        let StageOutput::Identified(identity) =
            flow().run(Stage::ResolveIdentity, &input(item.clone())).await.unwrap()
        else {
            panic!("应为身份结果");
        };
        assert!(identity.matched);

        let StageOutput::Graded(grade) = flow().run(Stage::Grade, &input(item.clone())).await.unwrap() else {
            panic!("应为评分结果");
        };
        item.grade = Some(grade);

        let output = flow().run(Stage::Export, &input(item)).await.unwrap();
        assert_eq!(output, StageOutput::Exported { path: "t/a".into() });
        assert!(!ItemFlow::abortable(Stage::Export));
    }
}
