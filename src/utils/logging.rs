/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use crate::models::{Stage, StageCounts};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 初始化日志
///
/// `RUST_LOG` 优先；否则默认 `info`，详细模式为 `debug`
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `concurrency`: 每个波次的并发数
/// - `target`: 要运行到的阶段
pub fn log_startup(concurrency: usize, target: Stage) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 作文批量批改模式");
    info!("📊 每波并发数: {}", concurrency);
    info!("🎯 目标阶段: {}", target);
    info!("{}", "=".repeat(60));
}

/// 记录条目加载信息
pub fn log_items_loaded(total: usize, concurrency: usize) {
    info!("✓ 找到 {} 份待处理的扫描件", total);
    info!("📋 将以每波 {} 份的方式处理", concurrency);
    info!("💡 每波全部结束后再开始下一波\n");
}

/// 记录阶段开始信息
pub fn log_stage_start(stage: Stage, eligible: usize, total: usize) {
    info!("\n{}", "=".repeat(60));
    info!("🧩 阶段「{}」开始: 待处理 {} / 共 {} 份", stage, eligible, total);
    info!("{}", "=".repeat(60));
}

/// 记录波次开始信息
///
/// # 参数
/// - `wave_num`: 波次编号（从 1 开始）
/// - `total_waves`: 波次总数
/// - `start`: 起始条目编号
/// - `end`: 结束条目编号
/// - `total`: 本阶段条目总数
pub fn log_wave_start(wave_num: usize, total_waves: usize, start: usize, end: usize, total: usize) {
    info!("\n{}", "=".repeat(60));
    info!("📦 开始处理第 {}/{} 波", wave_num, total_waves);
    info!("📄 本波条目: {}-{} / 共 {} 份", start, end, total);
    info!("{}", "=".repeat(60));
}

/// 记录波次完成信息
pub fn log_wave_complete(wave_num: usize, success: usize, total: usize) {
    info!("\n{}", "─".repeat(60));
    info!("✓ 第 {} 波完成: 成功 {}/{}", wave_num, success, total);
    info!("{}", "─".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `stage`: 最后运行的阶段
/// - `counts`: 该阶段的计数
/// - `export_path`: 导出文件路径（如果有）
pub fn print_final_stats(stage: Stage, counts: &StageCounts, export_path: Option<&str>) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计（{}）", stage);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", counts.completed, counts.total);
    info!("❌ 失败: {}", counts.failed);
    if counts.pending > 0 {
        info!("⏸️  未处理: {}", counts.pending);
    }
    info!("{}", "=".repeat(60));
    if let Some(path) = export_path {
        info!("\n结果已导出至: {}", path);
    }
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度（按字符计）
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("春眠不觉晓", 2), "春眠...");
        assert_eq!(truncate_text("短", 5), "短");
    }
}
