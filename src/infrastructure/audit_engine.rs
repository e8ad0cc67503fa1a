//! 审计引擎接口
//!
//! 引擎是黑盒：给定 URL 和一个存活的浏览器调试地址，返回指标或错误。

use async_trait::async_trait;

use crate::error::AuditError;
use crate::models::Metrics;

#[async_trait]
pub trait AuditEngine: Send + Sync {
    async fn audit(&self, url: &str, endpoint: &str) -> Result<Metrics, AuditError>;

    /// 取消时能否直接丢弃进行中的调用
    ///
    /// 不支持时，进行中的审计会一直运行到宽限期结束。
    fn supports_early_termination(&self) -> bool {
        false
    }
}
