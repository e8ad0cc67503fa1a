//! # Audit Pool
//!
//! 一个自适应并发的网页审计任务调度器
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure / Browser）
//! - `browser/` - 启动和终止浏览器进程，探测调试地址
//! - `infrastructure/` - 审计引擎接口与 Node 引擎实现
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，不关心调度顺序
//! - `ProcessSupervisor` - 浏览器进程的唯一所有者
//! - `RetryController` - 错误分类与退避
//! - `MemoryMonitor` - 内存采样与平滑
//! - `ProgressReporter` - 生命周期事件与汇总
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一次执行"的完整流程
//! - `AttemptCtx` - 上下文封装（job_id + attempt + slot）
//! - `AttemptFlow` - 流程编排（申请浏览器 → 审计 → 释放）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/run_coordinator` - 运行生命周期
//! - `orchestrator/worker_pool` - 自适应工作池，唯一的并发状态写者
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::{BrowserLauncher, ChromeLauncher};
pub use config::{Config, PoolConfig, RetryPolicy};
pub use error::{AppError, AppResult, ErrorKind};
pub use infrastructure::{AuditEngine, NodeAuditEngine};
pub use models::{AuditJob, AuditOutcome, AuditResult, JobId, JobState, Metrics};
pub use orchestrator::{PoolSnapshot, RunCoordinator, RunReport, RunState};
pub use services::{ProgressEvent, RunSummary};
pub use workflow::{AttemptCtx, AttemptFlow};
