use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::job::{AuditJob, JobId, JobState};

/// 审计指标（类别 → 分数）
pub type Metrics = BTreeMap<String, f64>;

/// 单个任务的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success {
        metrics: Metrics,
    },
    Failure {
        error_kind: ErrorKind,
        message: String,
    },
}

/// 审计结果，生成后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub job_id: JobId,
    pub url: String,
    pub plan_index: usize,
    pub state: JobState,
    pub outcome: AuditOutcome,
    pub duration_ms: u64,
    pub attempts_used: u32,
}

impl AuditResult {
    pub fn succeeded(job: &AuditJob, metrics: Metrics) -> Self {
        Self::from_job(job, JobState::Succeeded, AuditOutcome::Success { metrics })
    }

    pub fn failed(job: &AuditJob, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::from_job(
            job,
            JobState::FailedPermanent,
            AuditOutcome::Failure {
                error_kind,
                message: message.into(),
            },
        )
    }

    pub fn cancelled(job: &AuditJob, reason: impl Into<String>) -> Self {
        Self::from_job(
            job,
            JobState::Cancelled,
            AuditOutcome::Failure {
                error_kind: ErrorKind::Cancellation,
                message: reason.into(),
            },
        )
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }

    fn from_job(job: &AuditJob, state: JobState, outcome: AuditOutcome) -> Self {
        Self {
            job_id: job.id.clone(),
            url: job.url.clone(),
            plan_index: job.plan_index,
            state,
            outcome,
            duration_ms: job.elapsed_ms(),
            attempts_used: job.attempt(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeded_result_carries_attempts_and_metrics() {
        let mut job = AuditJob::new("job-7", "https://example.com", 7);
        job.begin_attempt();
        let mut metrics = Metrics::new();
        metrics.insert("performance".into(), 0.93);

        let result = AuditResult::succeeded(&job, metrics.clone());
        assert!(result.is_success());
        assert_eq!(result.attempts_used, 1);
        assert_eq!(result.plan_index, 7);
        assert_eq!(result.outcome, AuditOutcome::Success { metrics });
    }

    #[test]
    fn cancelled_before_start_has_zero_attempts() {
        let job = AuditJob::new("job-1", "https://example.com", 0);
        let result = AuditResult::cancelled(&job, "用户取消");
        assert_eq!(result.state, JobState::Cancelled);
        assert_eq!(result.attempts_used, 0);
        assert_eq!(result.duration_ms, 0);
    }

    #[test]
    fn failure_serializes_with_status_tag() {
        let mut job = AuditJob::new("job-2", "notaurl", 2);
        job.begin_attempt();
        let result = AuditResult::failed(&job, ErrorKind::Fatal, "非法 URL");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"]["status"], "failure");
        assert_eq!(json["outcome"]["error_kind"], "fatal");
        assert_eq!(json["state"], "failed_permanent");
    }
}
