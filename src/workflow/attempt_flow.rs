//! 单次执行流程 - 流程层
//!
//! 核心职责：定义"一次执行"的完整流程
//!
//! 流程顺序：
//! 1. 检查 URL（非法 URL 是致命错误，不启动浏览器）
//! 2. 向进程监管申请浏览器
//! 3. 在超时内调用审计引擎
//! 4. 无论结果如何都归还浏览器
//!
//! 取消信号分两级：`soft_cancel` 表示进入排空阶段，只有支持提前终止的引擎会被打断；
//! `hard_stop` 表示宽限期已过或槽位被收回，执行立即结束。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AttemptError, AuditError};
use crate::infrastructure::AuditEngine;
use crate::models::Metrics;
use crate::services::ProcessSupervisor;
use crate::workflow::attempt_ctx::AttemptCtx;

/// 单次执行结果
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed(Metrics),
    Failed(AttemptError),
    /// 被取消打断，不计入失败率
    Interrupted,
}

/// 单次执行流程
///
/// - 不持有浏览器，每次执行临时申请
/// - 不做重试决策，只报告结果
pub struct AttemptFlow {
    supervisor: ProcessSupervisor,
    engine: Arc<dyn AuditEngine>,
    attempt_timeout: Duration,
}

impl AttemptFlow {
    pub fn new(
        supervisor: ProcessSupervisor,
        engine: Arc<dyn AuditEngine>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            engine,
            attempt_timeout,
        }
    }

    pub async fn run(
        &self,
        ctx: &AttemptCtx,
        soft_cancel: &CancellationToken,
        hard_stop: &CancellationToken,
    ) -> AttemptOutcome {
        if let Err(e) = validate_url(&ctx.url) {
            return AttemptOutcome::Failed(e.into());
        }

        let lease = tokio::select! {
            biased;
            _ = hard_stop.cancelled() => return AttemptOutcome::Interrupted,
            acquired = self.supervisor.acquire(&ctx.job_id, ctx.attempt) => match acquired {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("{} ⚠️ 浏览器启动失败: {}", ctx, e);
                    return AttemptOutcome::Failed(e.into());
                }
            },
        };

        let endpoint = lease.handle().debug_endpoint.clone();
        let outcome = self.audit(ctx, &endpoint, soft_cancel, hard_stop).await;

        lease.release().await;
        outcome
    }

    async fn audit(
        &self,
        ctx: &AttemptCtx,
        endpoint: &str,
        soft_cancel: &CancellationToken,
        hard_stop: &CancellationToken,
    ) -> AttemptOutcome {
        let early_termination = self.engine.supports_early_termination();
        let call = tokio::time::timeout(self.attempt_timeout, self.engine.audit(&ctx.url, endpoint));

        tokio::select! {
            biased;
            _ = hard_stop.cancelled() => {
                debug!("{} 收到停止信号，中断审计", ctx);
                AttemptOutcome::Interrupted
            }
            _ = soft_cancel.cancelled(), if early_termination => {
                debug!("{} 运行已取消，提前终止审计", ctx);
                AttemptOutcome::Interrupted
            }
            result = call => match result {
                Ok(Ok(metrics)) => AttemptOutcome::Completed(metrics),
                Ok(Err(AuditError::Interrupted)) => AttemptOutcome::Interrupted,
                Ok(Err(e)) => AttemptOutcome::Failed(e.into()),
                Err(_) => AttemptOutcome::Failed(
                    AuditError::Timeout {
                        timeout_ms: self.attempt_timeout.as_millis() as u64,
                    }
                    .into(),
                ),
            },
        }
    }
}

/// 只接受带主机名的 http / https URL
pub fn validate_url(url: &str) -> Result<(), AuditError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| AuditError::InvalidUrl(format!("{url} (只支持 http/https)")))?;

    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    if host.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(AuditError::InvalidUrl(url.to_string()));
    }
    Ok(())
}
