//! 日志工具模块
//!
//! 提供日志初始化和输出格式化的辅助函数

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::models::RunStats;
use crate::orchestrator::{RunRequest, RunSummary};
use crate::services::reporter::format_duration;
use crate::services::ProgressSnapshot;

/// 初始化 tracing 订阅器
///
/// 优先使用 `RUST_LOG`，否则为 `info`（`verbose` 时为 `debug`）。重复调用无副作用。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录运行开始信息
pub fn log_run_start(request: &RunRequest, worker_count: usize) {
    info!("{}", "=".repeat(60));
    info!("🚀 批量处方提取启动");
    info!("📁 文件夹: {}", request.folder_id);
    info!("📊 并发数: {}", worker_count);
    info!(
        "💾 输出: {} | 断点: {}",
        request.output_path.display(),
        request.checkpoint_path.display()
    );
    if request.resume {
        info!("🔁 续跑模式：跳过断点中已完成的文档");
    }
    info!("{}", "=".repeat(60));
}

/// 记录文档加载信息
pub fn log_documents_loaded(total: usize, resumed: usize, pending: usize) {
    info!("✓ 共找到 {} 个文档", total);
    if resumed > 0 {
        info!("⏭️ 已完成（从断点恢复）: {}", resumed);
    }
    info!("📋 待处理: {}", pending);
}

/// 记录处理进度
pub fn log_progress(stats: &RunStats, snapshot: &ProgressSnapshot) {
    let throughput = snapshot
        .throughput_per_minute
        .map(|t| format!("{:.1} 个/分钟", t))
        .unwrap_or_else(|| "-".to_string());
    let eta = snapshot
        .eta
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());

    info!(
        "📈 进度 {}/{} ({:.1}%) | ✅ {} ⚠️ {} ❌ {} | {} | 预计剩余 {} | 费用 ${:.2} (预计 ${:.2})",
        stats.processed_count,
        stats.total_documents,
        snapshot.completion_percentage,
        stats.success_count,
        stats.partial_count,
        stats.failed_count,
        throughput,
        eta,
        snapshot.current_cost,
        snapshot.estimated_cost
    );
}

/// 打印最终统计信息
pub fn print_final_stats(summary: &RunSummary) {
    info!("{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("📄 文档总数: {}", summary.total);
    info!("✅ 成功: {}", summary.success);
    info!("⚠️ 部分成功: {}", summary.partial);
    info!("❌ 失败: {}", summary.failed);
    if summary.resumed > 0 {
        info!("⏭️ 从断点恢复: {}", summary.resumed);
    }
    if summary.interrupted {
        info!("⏸️ 已中断，未开始: {}", summary.not_dispatched);
    }
    info!(
        "🔢 Tokens: {} 输入 / {} 输出",
        summary.tokens_in, summary.tokens_out
    );
    info!("💰 费用: ${:.2}", summary.snapshot.current_cost);
    if let Some(t) = summary.snapshot.throughput_per_minute {
        info!("⚡ 吞吐: {:.1} 个/分钟", t);
    }
    info!("⏱️ 耗时: {}", format_duration(summary.elapsed));
    info!("{}", "=".repeat(60));
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大字符数
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
