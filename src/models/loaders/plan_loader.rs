use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::error::PlanError;
use crate::models::job::{AuditJob, JobId};

/// 任务计划文件
///
/// ```toml
/// [[jobs]]
/// id = "home"
/// url = "https://example.com/"
///
/// [[jobs]]
/// url = "https://example.com/pricing"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AuditPlan {
    #[serde(default)]
    pub jobs: Vec<PlanEntry>,
}

/// 计划中的一个条目
#[derive(Debug, Clone, Deserialize)]
pub struct PlanEntry {
    /// 缺省为 `job-<序号>`
    pub id: Option<String>,
    pub url: String,
}

/// 从 TOML 文件加载任务计划并转换为任务列表
pub async fn load_plan(plan_file_path: &Path) -> Result<Vec<AuditJob>> {
    let content = fs::read_to_string(plan_file_path)
        .await
        .with_context(|| format!("无法读取任务计划: {}", plan_file_path.display()))?;

    let plan = parse_plan(&content)
        .with_context(|| format!("无法解析任务计划: {}", plan_file_path.display()))?;

    let jobs = jobs_from_plan(plan)?;
    tracing::info!(
        "✓ 已加载任务计划 {}，共 {} 个任务",
        plan_file_path.display(),
        jobs.len()
    );
    Ok(jobs)
}

pub fn parse_plan(content: &str) -> Result<AuditPlan, toml::de::Error> {
    toml::from_str(content)
}

/// 按计划顺序生成任务，检查 ID 唯一和 URL 非空
pub fn jobs_from_plan(plan: AuditPlan) -> Result<Vec<AuditJob>, PlanError> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(plan.jobs.len());

    for (index, entry) in plan.jobs.into_iter().enumerate() {
        let url = entry.url.trim().to_string();
        if url.is_empty() {
            return Err(PlanError::InvalidEntry {
                index: index + 1,
                reason: "url 为空".to_string(),
            });
        }

        let id = entry
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("job-{}", index + 1));
        if !seen.insert(id.clone()) {
            return Err(PlanError::DuplicateJobId { job_id: id });
        }

        jobs.push(AuditJob::new(JobId::new(id), url, index));
    }

    Ok(jobs)
}
