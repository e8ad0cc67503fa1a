//! 业务能力层（Services）
//!
//! 每个服务只描述一种能力，不关心调度顺序：
//! - `retry_controller` - 错误分类与退避
//! - `memory_monitor` - 内存采样与平滑
//! - `process_supervisor` / `process_ledger` - 浏览器进程的所有权与清理
//! - `progress_reporter` - 生命周期事件与汇总
//! - `run_history` - 运行历史

pub mod memory_monitor;
pub mod process_ledger;
pub mod process_supervisor;
pub mod progress_reporter;
pub mod retry_controller;
pub mod run_history;

pub use memory_monitor::{
    MemoryMonitor, MemoryPressure, MemoryProbe, MemoryReading, MemoryTrend, SystemMemoryProbe,
};
pub use process_ledger::ProcessLedger;
pub use process_supervisor::{BrowserHandle, BrowserLease, ProcessSupervisor, SweepReport};
pub use progress_reporter::{ProgressEvent, ProgressReporter, ProgressSender, RunSummary};
pub use retry_controller::{
    Classification, DefaultClassifier, ErrorClassifier, FinalizeReason, RetryController,
    RetryDecision,
};
pub use run_history::{HistoryEntry, RunHistory};
