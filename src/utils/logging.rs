/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::RunReport;

/// 初始化 tracing 订阅器
///
/// 设置了 `RUST_LOG` 时以其为准，否则按 `verbose` 选择 debug 或 info。
/// 重复调用是安全的（测试中常见），后续调用不生效。
pub fn init(verbose: bool) {
    let default_level = if verbose {
        "audit_pool=debug,warn"
    } else {
        "audit_pool=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();
}

/// 初始化日志文件
///
/// # 参数
/// - `log_file_path`: 日志文件路径
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n审计运行日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    let pool = &config.pool;
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 自适应审计模式");
    info!(
        "📊 并发范围: {}-{} (初始 {})",
        pool.min_concurrency,
        pool.max_concurrency,
        pool.starting_concurrency()
    );
    info!(
        "🧠 内存水位线: {:.1} GiB",
        pool.memory_high_watermark_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    info!(
        "↻ 最多执行 {} 次，退避基数 {}ms",
        config.retry.max_attempts, config.retry.backoff_base_ms
    );
    info!("{}", "=".repeat(60));
}

/// 打印最终统计信息
///
/// # 参数
/// - `report`: 运行报告
/// - `log_file_path`: 日志文件路径
pub fn print_final_stats(report: &RunReport, log_file_path: &str) {
    let total = report.results.len();
    info!("\n{}", "=".repeat(60));
    info!("📊 运行 {} 统计 ({})", report.run_id, report.state);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", report.succeeded(), total);
    info!("❌ 失败: {}", report.failed());
    info!("⏹ 取消: {}", report.cancelled());
    info!("↻ 重试: {}", report.summary.retries);
    info!(
        "⚙️ 并发: 最终 {} (范围 {}-{}，收缩 {} 次，增长 {} 次)",
        report.pool.final_concurrency,
        report.pool.min_observed_concurrency,
        report.pool.max_observed_concurrency,
        report.pool.shrink_events,
        report.pool.grow_events
    );
    if let Some(reason) = &report.cancel_reason {
        info!("取消原因: {}", reason);
    }
    info!("{}", "=".repeat(60));
    if !log_file_path.is_empty() {
        info!("\n日志已保存至: {}", log_file_path);
    }
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
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
