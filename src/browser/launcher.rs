//! 浏览器启动器接口
//!
//! 进程监管只通过这个接口启动和终止浏览器，方便替换为真实 Chrome 或测试替身。

use async_trait::async_trait;

use crate::error::{LaunchError, SupervisorError};
use crate::models::JobId;

/// 单次启动参数
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub job_id: JobId,
    /// 执行序号，每次执行都使用独立的浏览器
    pub attempt: u32,
    pub run_id: String,
}

/// 已启动的浏览器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedBrowser {
    pub process_id: u32,
    /// 调试地址（`ws://...`）
    pub endpoint: String,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<LaunchedBrowser, LaunchError>;

    /// 终止进程；进程已经退出也视为成功
    async fn kill(&self, process_id: u32) -> Result<(), SupervisorError>;
}
