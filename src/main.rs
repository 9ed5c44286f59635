use anyhow::Result;
use clap::Parser;
use essay_batch::orchestrator::{App, CancellationController, RunMode, RunOptions};
use essay_batch::utils::logging;
use essay_batch::{Config, Stage};
use tracing::{error, info};

/// 批量批改手写作文扫描件
#[derive(Parser, Debug)]
#[command(name = "run-batch", version, about)]
struct Args {
    /// 扫描件所在目录（可包含 task.toml）
    #[arg(short, long)]
    input: String,

    /// 每个波次的并发数
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// 单个条目的最大重试次数
    #[arg(long)]
    max_retries: Option<u32>,

    /// 运行到哪个阶段（含）
    #[arg(short, long, default_value = "export")]
    stage: Stage,

    /// TOML 配置文件
    #[arg(long)]
    config: Option<String>,

    /// 快照目录
    #[arg(long)]
    state_dir: Option<String>,

    /// 导出目录
    #[arg(short, long)]
    output: Option<String>,

    /// 恢复指定任务
    #[arg(long)]
    task_id: Option<String>,

    /// 失败的条目重新处理
    #[arg(long, conflicts_with = "retry_all")]
    retry_failed: bool,

    /// 所有条目重新处理
    #[arg(long)]
    retry_all: bool,

    /// 显示详细日志
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn mode(&self) -> RunMode {
        if self.retry_all {
            RunMode::RetryAll
        } else if self.retry_failed {
            RunMode::RetryFailed
        } else {
            RunMode::Resume
        }
    }

    /// 配置文件 → 环境变量 → 命令行
    fn load_config(&self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::from_toml_file(path)?,
            None => Config::default(),
        };
        let mut config = base.with_env_overrides()?;
        if let Some(c) = self.concurrency {
            config.concurrency = c;
        }
        if let Some(r) = self.max_retries {
            config.max_retries = r;
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(dir) = &self.output {
            config.output_dir = dir.clone();
        }
        config.verbose_logging |= self.verbose;
        Ok(config)
    }
}

async fn run(args: Args) -> Result<i32> {
    let config = args.load_config()?;
    logging::init(config.verbose_logging);

    let options = RunOptions {
        input_dir: args.input.clone(),
        target: args.stage,
        mode: args.mode(),
        task_id: args.task_id.clone(),
    };
    let app = App::initialize(config, options).await?;

    let cancel = CancellationController::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let outcome = app.run(&cancel).await?;
    let code = outcome.exit_code();
    match code {
        0 => info!("✅ 全部完成"),
        2 => info!("⚠️ {} 份作文处理失败，可使用 --retry-failed 重试", outcome.failed_items()),
        130 => info!("⛔ 已取消，进度已保存，任务 ID: {}", outcome.task.id),
        _ => {}
    }
    Ok(code)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            logging::init(false);
            error!("❌ 运行失败: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
