//! 审计任务
//!
//! 一个任务 = 对一个 URL 的一次完整审计（可能包含多次执行）

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

/// 任务 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    AwaitingRetry,
    Succeeded,
    FailedPermanent,
    Cancelled,
}

impl JobState {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::FailedPermanent | JobState::Cancelled
        )
    }

    fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, AwaitingRetry) | (Running, Queued) => true,
            (Running, Succeeded) | (Running, FailedPermanent) | (Running, Cancelled) => true,
            (AwaitingRetry, Running) | (AwaitingRetry, Cancelled) => true,
            _ => false,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::AwaitingRetry => "awaiting_retry",
            JobState::Succeeded => "succeeded",
            JobState::FailedPermanent => "failed_permanent",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// 审计任务
///
/// `attempt` 只在执行被让出时回退；状态只能沿合法路径前进，终态之后不再变化。
#[derive(Debug, Clone)]
pub struct AuditJob {
    pub id: JobId,
    pub url: String,
    /// 在原始计划中的位置（调度顺序和结果排序都以此为准）
    pub plan_index: usize,
    attempt: u32,
    state: JobState,
    first_started_at: Option<Instant>,
}

impl AuditJob {
    pub fn new(id: impl Into<JobId>, url: impl Into<String>, plan_index: usize) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            plan_index,
            attempt: 0,
            state: JobState::Queued,
            first_started_at: None,
        }
    }

    /// 已开始的执行次数
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// 开始新一次执行，返回本次执行序号（从 1 开始）
    pub fn begin_attempt(&mut self) -> u32 {
        self.transition(JobState::Running);
        self.attempt += 1;
        self.first_started_at.get_or_insert_with(Instant::now);
        self.attempt
    }

    /// 执行被让出且没有结果：回到排队状态，这次执行不计数
    pub fn yield_attempt(&mut self) {
        self.transition(JobState::Queued);
        self.attempt = self.attempt.saturating_sub(1);
        if self.attempt == 0 {
            self.first_started_at = None;
        }
    }

    /// 进入退避等待
    pub fn await_retry(&mut self) {
        self.transition(JobState::AwaitingRetry);
    }

    /// 进入终态
    pub fn finish(&mut self, state: JobState) {
        debug_assert!(state.is_terminal(), "{state} 不是终态");
        self.transition(state);
    }

    /// 从第一次执行开始到现在的耗时（从未执行过则为 0）
    pub fn elapsed_ms(&self) -> u64 {
        self.first_started_at
            .map(|t| t.elapsed().as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }

    fn transition(&mut self, next: JobState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "[任务 {}] ⚠️ 非法状态转换: {} → {}",
                self.id, self.state, next
            );
            debug_assert!(false, "非法状态转换: {} → {}", self.state, next);
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_queued_with_zero_attempts() {
        let job = AuditJob::new("job-1", "https://example.com", 0);
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.attempt(), 0);
        assert_eq!(job.elapsed_ms(), 0);
    }

    #[test]
    fn attempts_increase_through_retry_cycle() {
        let mut job = AuditJob::new("job-1", "https://example.com", 0);
        assert_eq!(job.begin_attempt(), 1);
        job.await_retry();
        assert_eq!(job.state(), JobState::AwaitingRetry);
        assert_eq!(job.begin_attempt(), 2);
        job.finish(JobState::Succeeded);
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(job.attempt(), 2);
    }

    #[test]
    fn yielded_attempt_is_not_counted() {
        let mut job = AuditJob::new("job-1", "https://example.com", 0);
        assert_eq!(job.begin_attempt(), 1);
        job.yield_attempt();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.attempt(), 0);
        assert_eq!(job.elapsed_ms(), 0);

        // 重新派发时仍是第 1 次执行
        assert_eq!(job.begin_attempt(), 1);
        job.await_retry();
        assert_eq!(job.begin_attempt(), 2);
        job.yield_attempt();
        assert_eq!(job.attempt(), 1);
        assert_eq!(job.begin_attempt(), 2);
    }

    #[test]
    fn queued_job_can_be_cancelled() {
        let mut job = AuditJob::new("job-1", "https://example.com", 0);
        job.finish(JobState::Cancelled);
        assert!(job.state().is_terminal());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::FailedPermanent.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::AwaitingRetry.is_terminal());
    }

    #[test]
    fn job_id_serializes_as_plain_string() {
        let id = JobId::new("home-page");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"home-page\"");
    }
}
