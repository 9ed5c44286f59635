#![allow(dead_code)]

use async_trait::async_trait;
use essay_batch::error::{AppResult, OperationError};
use essay_batch::models::{GradeResult, GradingContext, Item, Recognition, SourceRef, Task, TaskConfig};
use essay_batch::orchestrator::{
    CancellationController, Pipeline, PipelineOptions, RetryPolicy, WaveOptions,
};
use essay_batch::persistence::{MemoryStore, PersistenceManager};
use essay_batch::services::{ExportRecord, Exporter, Grader, Recognizer};
use essay_batch::workflow::ItemFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 图片内容以 `bad` 开头的条目识别失败
pub struct ScriptedRecognizer {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub delay: Duration,
    /// 为假时 `bad` 条目永久失败
    pub healthy: AtomicBool,
    /// 为真时所有调用都返回网络类错误
    pub offline: AtomicBool,
    /// 第 N 次调用时触发取消
    pub cancel_at: Mutex<Option<(usize, CancellationController)>>,
}

impl ScriptedRecognizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
            healthy: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            cancel_at: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// 让测试和流水线共享同一个识别器
pub struct SharedRecognizer(pub Arc<ScriptedRecognizer>);

#[async_trait]
impl Recognizer for SharedRecognizer {
    async fn recognize(&self, image: &[u8], mime: &str) -> Result<Recognition, OperationError> {
        self.0.recognize(image, mime).await
    }
}

impl ScriptedRecognizer {
    async fn recognize(&self, image: &[u8], _mime: &str) -> Result<Recognition, OperationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let trigger = self
            .cancel_at
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(at, _)| *at == call)
            .map(|(_, cancel)| cancel.clone());
        if let Some(cancel) = trigger {
            cancel.cancel();
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.offline.load(Ordering::SeqCst) {
            return Err(OperationError::transient("connection refused"));
        }
        let text = String::from_utf8_lossy(image).to_string();
        if text.starts_with("bad") && !self.healthy.load(Ordering::SeqCst) {
            return Err(OperationError::permanent("图片无法识别"));
        }
        Ok(Recognition {
            text,
            confidence: 0.95,
        })
    }
}

pub struct LengthGrader;

#[async_trait]
impl Grader for LengthGrader {
    async fn grade(&self, text: &str, ctx: &GradingContext) -> Result<GradeResult, OperationError> {
        Ok(GradeResult {
            score: (text.chars().count() as f64).min(ctx.max_score),
            feedback: "结构完整".into(),
            improved: text.into(),
        })
    }
}

#[derive(Default)]
pub struct RecordingExporter {
    pub exported: Mutex<Vec<String>>,
}

#[async_trait]
impl Exporter for RecordingExporter {
    async fn export_item(&self, task_id: &str, record: &ExportRecord) -> Result<String, OperationError> {
        self.exported.lock().unwrap().push(record.item_id.clone());
        Ok(format!("{}/{}.json", task_id, record.item_id))
    }

    async fn finalize(&self, task: &Task) -> AppResult<String> {
        Ok(format!("{}.json", task.id))
    }
}

/// `n` 份内存中的扫描件，`bad` 中列出的下标识别会失败
pub fn essay_items(n: usize, bad: &[usize]) -> Vec<Item> {
    (0..n)
        .map(|i| {
            let body = if bad.contains(&i) {
                format!("bad scan {}", i)
            } else {
                format!("姓名：学生{}\n我的春天 {}", i, i)
            };
            Item::new(
                format!("essay-{:03}", i),
                SourceRef::inline(format!("{:03}.png", i), body.into_bytes()),
            )
        })
        .collect()
}

pub fn fast_options(concurrency: usize) -> PipelineOptions {
    PipelineOptions {
        wave: WaveOptions {
            concurrency,
            inter_wave_delay: Duration::from_millis(5),
            abort_on_unreachable: true,
        },
        retry: RetryPolicy {
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
            abort_on_cancel: true,
        },
    }
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub exporter: Arc<RecordingExporter>,
    pub persistence: Arc<PersistenceManager>,
}

pub fn harness(items: Vec<Item>, concurrency: usize, delay: Duration) -> Harness {
    let recognizer = Arc::new(ScriptedRecognizer::new(delay));
    let exporter = Arc::new(RecordingExporter::default());
    let flow = ItemFlow::new(
        Box::new(SharedRecognizer(recognizer.clone())),
        Box::new(LengthGrader),
        exporter.clone(),
    );
    let store = Arc::new(MemoryStore::new(50 * 1024 * 1024));
    let persistence = Arc::new(PersistenceManager::new(store, 5 * 1024 * 1024));
    let task = Task::new("期中作文", TaskConfig::default(), items);
    let pipeline = Pipeline::new(
        task,
        Arc::new(flow),
        persistence.clone(),
        fast_options(concurrency),
    );
    Harness {
        pipeline,
        recognizer,
        exporter,
        persistence,
    }
}
