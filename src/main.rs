use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use audit_pool::browser::ChromeLauncher;
use audit_pool::config::Config;
use audit_pool::infrastructure::NodeAuditEngine;
use audit_pool::models::{load_plan, AuditOutcome, JobState};
use audit_pool::orchestrator::{RunCoordinator, RunReport};
use audit_pool::services::{HistoryEntry, RunHistory};
use audit_pool::utils::logging;
use audit_pool::utils::truncate_text;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load().context("加载配置失败")?;

    // 初始化日志
    logging::init(config.verbose_logging);
    if !config.output_log_file.is_empty() {
        logging::init_log_file(&config.output_log_file)
            .with_context(|| format!("无法创建日志文件: {}", config.output_log_file))?;
    }
    logging::log_startup(&config);

    let jobs = load_plan(&config.plan_file).await?;
    if jobs.is_empty() {
        warn!("⚠️ 任务计划为空，无需运行");
        return Ok(());
    }

    let launcher = ChromeLauncher::new(&config.browser)?;
    info!("✓ 浏览器: {}", launcher.executable().display());

    let engine = NodeAuditEngine::from_config(&config.engine)?;
    let node_version = engine.verify_node().await?;
    info!("✓ Node {}", node_version);

    let coordinator = Arc::new(RunCoordinator::new(
        config.clone(),
        Arc::new(launcher),
        Arc::new(engine),
    )?);

    // Ctrl+C 触发排空
    let interrupt = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel("收到 Ctrl+C");
        }
    });

    let report = coordinator.run(jobs).await?;

    let output_dir = config.output_root.join(&report.run_id);
    write_report(&output_dir, &report).await?;

    if let Some(state_dir) = &config.state_dir {
        let entry = HistoryEntry {
            id: report.run_id.clone(),
            created_at: chrono::Local::now().to_rfc3339(),
            job_count: report.results.len(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            cancelled: report.cancelled(),
            final_state: report.state,
            output_dir: output_dir.display().to_string(),
        };
        if let Err(e) = RunHistory::in_dir(state_dir).record(entry).await {
            warn!("⚠️ 写入运行历史失败: {:#}", e);
        }
    }

    for result in &report.results {
        if let (JobState::FailedPermanent, AuditOutcome::Failure { message, .. }) =
            (result.state, &result.outcome)
        {
            error!("[任务 {}] ❌ {}", result.job_id, truncate_text(message, 120));
        }
    }

    logging::print_final_stats(&report, &config.output_log_file);
    Ok(())
}

async fn write_report(output_dir: &Path, report: &RunReport) -> Result<()> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("无法创建输出目录: {}", output_dir.display()))?;

    let path = output_dir.join("results.json");
    let content = serde_json::to_string_pretty(report).context("序列化运行结果失败")?;
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("无法写入运行结果: {}", path.display()))?;

    info!("💾 结果已写入: {}", path.display());
    Ok(())
}
