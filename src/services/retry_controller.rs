//! 重试控制器 - 业务能力层
//!
//! 只负责"这次失败之后怎么办"，不关心调度：
//! - 把执行错误分类为瞬时 / 致命
//! - 瞬时错误且还有剩余次数时给出退避延迟
//! - 其余情况终结任务

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::RetryPolicy;
use crate::error::{AttemptError, ErrorKind};
use crate::models::AuditJob;

/// 指数退避的最大指数，避免移位溢出
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// 错误分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Transient,
    Fatal,
}

/// 可替换的错误分类策略
pub trait ErrorClassifier: std::fmt::Debug + Send + Sync {
    fn classify(&self, error: &AttemptError) -> Classification;
}

/// 默认分类：只有致命错误不重试，资源错误也按瞬时错误重新排队
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, error: &AttemptError) -> Classification {
        match error.kind() {
            ErrorKind::Fatal => Classification::Fatal,
            ErrorKind::Transient
            | ErrorKind::Resource
            | ErrorKind::Supervisor
            | ErrorKind::Cancellation => Classification::Transient,
        }
    }
}

/// 终结原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// 致命错误，没有重试
    Fatal,
    /// 重试次数已用完
    RetriesExhausted,
}

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 延迟后重新排队
    Requeue {
        delay: Duration,
        classification: Classification,
    },
    /// 终结为永久失败
    Finalize { reason: FinalizeReason },
}

/// 重试控制器
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, error: &AttemptError) -> Classification {
        self.policy.classifier.classify(error)
    }

    /// 根据一次失败的执行给出决策
    ///
    /// `job.attempt()` 是刚结束的那次执行的序号
    pub fn on_outcome(&self, job: &AuditJob, error: &AttemptError) -> RetryDecision {
        match self.classify(error) {
            Classification::Fatal => RetryDecision::Finalize {
                reason: FinalizeReason::Fatal,
            },
            Classification::Transient if job.attempt() >= self.policy.max_attempts => {
                RetryDecision::Finalize {
                    reason: FinalizeReason::RetriesExhausted,
                }
            }
            Classification::Transient => RetryDecision::Requeue {
                delay: self.backoff_delay(job.attempt()),
                classification: Classification::Transient,
            },
        }
    }

    /// 第 `attempt` 次失败之后的退避延迟（含随机抖动）
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.policy.backoff_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.policy.backoff_jitter_ms)
        } else {
            0
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }

    /// 不含抖动的部分：`base * 2^(attempt-1)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        Duration::from_millis(self.policy.backoff_base_ms.saturating_mul(1u64 << exponent))
    }
}
