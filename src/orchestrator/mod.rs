//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责调度和并发控制，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `run_coordinator` - 运行协调器
//! - 管理运行生命周期（Idle → Running → Draining → Completed / Aborted）
//! - 启动和停止内存监控、进度报告
//! - 运行前后清理孤儿浏览器进程
//! - 按计划顺序整理结果
//!
//! ### `worker_pool` - 自适应工作池
//! - 单一控制循环派发任务、处理结果、调度重试
//! - 根据内存和失败率收缩或增长并发
//! - 取消时排空并在宽限期后强制释放
//!
//! ### `pool_state` - 并发状态
//! - 结果窗口与收缩 / 增长规则（纯逻辑）
//! - 对外快照
//!
//! ## 层次关系
//!
//! ```text
//! run_coordinator (一次运行)
//!     ↓
//! worker_pool (Vec<AuditJob>，并发控制)
//!     ↓
//! workflow::AttemptFlow (单次执行)
//!     ↓
//! services (能力层：supervisor / retry / memory / progress)
//!     ↓
//! browser / infrastructure (浏览器进程、审计引擎)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一写者**：并发状态只由控制循环修改
//! 2. **资源隔离**：浏览器进程只由 ProcessSupervisor 持有
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure

pub mod pool_state;
pub mod run_coordinator;
pub mod worker_pool;

// 重新导出主要类型
pub use pool_state::{PoolSnapshot, ShrinkReason};
pub use run_coordinator::{new_run_id, validate_plan, RunCoordinator, RunReport, RunState};
pub use worker_pool::{PoolReport, PoolRun, WorkerPool};
