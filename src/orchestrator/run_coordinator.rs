//! 运行协调器 - 编排层
//!
//! ## 职责
//!
//! 管理一次运行的完整生命周期：
//!
//! 1. **状态机**：Idle → Running →（取消时 Draining）→ Completed | Aborted
//! 2. **启动前检查**：配置和任务计划非法时直接中止，不派发任何任务
//! 3. **资源清理**：运行开始和结束时各做一次孤儿进程清理
//! 4. **结果整理**：不论完成顺序如何，最终结果按计划顺序返回
//!
//! 外部通过 `subscribe` 获取生命周期事件，通过 `snapshot` 读取工作池状态，
//! 通过 `cancel` 请求排空。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::browser::BrowserLauncher;
use crate::config::Config;
use crate::error::{AppResult, ConfigError, PlanError, RunError};
use crate::infrastructure::AuditEngine;
use crate::models::{AuditJob, AuditResult, JobState};
use crate::orchestrator::pool_state::PoolSnapshot;
use crate::orchestrator::worker_pool::{PoolReport, WorkerPool};
use crate::services::{
    progress_reporter, MemoryMonitor, MemoryProbe, ProcessLedger, ProcessSupervisor,
    ProgressEvent, RetryController, RunSummary, SweepReport, SystemMemoryProbe,
};
use crate::workflow::AttemptFlow;

/// 订阅通道容量，落后太多的订阅者会丢失最早的事件
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Completed,
    Aborted,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// 一次运行的最终报告
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    /// 按计划顺序排列
    pub results: Vec<AuditResult>,
    pub summary: RunSummary,
    pub pool: PoolReport,
    pub cancel_reason: Option<String>,
    pub initial_sweep: SweepReport,
    pub final_sweep: SweepReport,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.count(JobState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(JobState::FailedPermanent)
    }

    pub fn cancelled(&self) -> usize {
        self.count(JobState::Cancelled)
    }

    fn count(&self, state: JobState) -> usize {
        self.results.iter().filter(|r| r.state == state).count()
    }
}

/// 运行协调器
pub struct RunCoordinator {
    config: Config,
    run_id: String,
    supervisor: ProcessSupervisor,
    engine: Arc<dyn AuditEngine>,
    memory_probe: Arc<dyn MemoryProbe>,
    events: broadcast::Sender<ProgressEvent>,
    snapshot: Arc<watch::Sender<PoolSnapshot>>,
    state: watch::Sender<RunState>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
}

/// 运行 ID：`run-<毫秒时间戳>`
pub fn new_run_id() -> String {
    format!("run-{}", chrono::Utc::now().timestamp_millis())
}

impl RunCoordinator {
    /// 创建协调器；配置非法时拒绝创建
    pub fn new(
        config: Config,
        launcher: Arc<dyn BrowserLauncher>,
        engine: Arc<dyn AuditEngine>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let run_id = new_run_id();
        let capacity = config
            .browser
            .max_live_browsers
            .unwrap_or(config.pool.max_concurrency);
        let ledger = config.state_dir.as_deref().map(ProcessLedger::in_dir);
        let supervisor = ProcessSupervisor::new(launcher, run_id.clone(), capacity, ledger);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(PoolSnapshot::default());
        let (state, _) = watch::channel(RunState::Idle);

        Ok(Self {
            config,
            run_id,
            supervisor,
            engine,
            memory_probe: Arc::new(SystemMemoryProbe::new()),
            events,
            snapshot: Arc::new(snapshot),
            state,
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
        })
    }

    /// 替换内存读数来源
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// 当前工作池快照
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// 请求取消：停止派发，进行中的执行进入宽限期
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self
                .cancel_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }
        let draining = self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Draining;
                true
            } else {
                false
            }
        });
        if draining {
            warn!("⏹ 运行 {} 进入排空阶段: {}", self.run_id, reason);
        }
        self.cancel.cancel();
    }

    /// 执行任务计划，返回按计划顺序排列的结果
    pub async fn run(&self, plan: Vec<AuditJob>) -> AppResult<RunReport> {
        let started = self.state.send_if_modified(|state| {
            if *state == RunState::Idle {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(RunError::AlreadyStarted {
                state: self.state().to_string(),
            }
            .into());
        }

        if let Err(e) = self.config.validate() {
            error!("❌ 配置非法，运行中止: {}", e);
            self.state.send_replace(RunState::Aborted);
            return Err(e.into());
        }
        if let Err(e) = validate_plan(&plan) {
            error!("❌ 任务计划非法，运行中止: {}", e);
            self.state.send_replace(RunState::Aborted);
            return Err(e.into());
        }

        let total = plan.len();
        info!("{}", "=".repeat(60));
        info!("🚀 运行 {} 开始: {} 个任务", self.run_id, total);
        info!("{}", "=".repeat(60));

        let initial_sweep = self.supervisor.sweep_orphans().await;

        let monitor_stop = CancellationToken::new();
        let monitor = MemoryMonitor::new(
            self.memory_probe.clone(),
            self.config.pool.memory_high_watermark_bytes,
            self.config.memory.history_len,
        )
        .start(
            Duration::from_millis(self.config.memory.sample_interval_ms),
            monitor_stop.clone(),
        )
        .await;

        let (progress, reporter) = progress_reporter::channel(self.events.clone());
        let reporter = if self.config.output_log_file.is_empty() {
            reporter
        } else {
            reporter.with_log_file(&self.config.output_log_file)
        };
        let reporter = reporter.spawn();
        for job in &plan {
            progress.notify(ProgressEvent::Queued {
                job_id: job.id.clone(),
                url: job.url.clone(),
            });
        }

        let flow = AttemptFlow::new(
            self.supervisor.clone(),
            self.engine.clone(),
            Duration::from_millis(self.config.engine.attempt_timeout_ms),
        );
        let pool = WorkerPool::new(
            self.config.pool.clone(),
            RetryController::new(self.config.retry.clone()),
            flow,
            self.supervisor.clone(),
            monitor.pressure.clone(),
            progress.clone(),
            Duration::from_millis(self.config.grace_period_ms),
        )
        .with_snapshot(self.snapshot.clone());

        let mut slots: Vec<Option<AuditResult>> = vec![None; total];
        let pending_jobs = plan.clone();
        let mut pool_run = pool.submit(plan, self.cancel.clone());
        while let Some(result) = pool_run.next_result().await {
            match slots.get_mut(result.plan_index) {
                Some(slot) if slot.is_none() => *slot = Some(result),
                _ => warn!(
                    "[任务 {}] ⚠️ 重复或越界的结果 (计划序号 {})，忽略",
                    result.job_id, result.plan_index
                ),
            }
        }
        let pool_report = match pool_run.join().await {
            Ok(report) => report,
            Err(e) => {
                error!("❌ {}", e);
                PoolReport::default()
            }
        };

        // 理论上不会发生：控制循环保证每个任务都有终态结果
        let results: Vec<AuditResult> = slots
            .into_iter()
            .zip(pending_jobs)
            .map(|(slot, job)| {
                slot.unwrap_or_else(|| {
                    error!("[任务 {}] ❌ 缺少最终结果，记为取消", job.id);
                    progress.notify(ProgressEvent::Cancelled {
                        job_id: job.id.clone(),
                        attempts: job.attempt(),
                    });
                    AuditResult::cancelled(&job, "缺少最终结果")
                })
            })
            .collect();

        monitor_stop.cancel();
        if let Err(e) = monitor.task.await {
            warn!("⚠️ 内存监控任务异常退出: {}", e);
        }
        drop(progress);
        let summary = reporter.await.unwrap_or_else(|e| {
            warn!("⚠️ 进度报告任务异常退出: {}", e);
            RunSummary::default()
        });

        self.supervisor.release_all().await;
        let final_sweep = self.supervisor.sweep_orphans().await;

        let final_state = if self.cancel.is_cancelled() {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        self.state.send_replace(final_state);

        let cancel_reason = self
            .cancel_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info!(
            "🏁 运行 {} 结束 ({}): 成功 {}, 失败 {}, 取消 {}",
            self.run_id, final_state, summary.succeeded, summary.failed, summary.cancelled
        );

        Ok(RunReport {
            run_id: self.run_id.clone(),
            state: final_state,
            results,
            summary,
            pool: pool_report,
            cancel_reason,
            initial_sweep,
            final_sweep,
        })
    }
}

/// 检查任务 ID 唯一且计划序号与位置一致
pub fn validate_plan(plan: &[AuditJob]) -> Result<(), PlanError> {
    let mut seen = HashSet::with_capacity(plan.len());
    for (index, job) in plan.iter().enumerate() {
        if !seen.insert(&job.id) {
            return Err(PlanError::DuplicateJobId {
                job_id: job.id.to_string(),
            });
        }
        if job.plan_index != index {
            return Err(PlanError::InvalidEntry {
                index: index + 1,
                reason: format!("计划序号 {} 与位置不一致", job.plan_index),
            });
        }
        if job.state() != JobState::Queued {
            return Err(PlanError::InvalidEntry {
                index: index + 1,
                reason: format!("任务状态为 {}，只能提交排队中的任务", job.state()),
            });
        }
    }
    Ok(())
}
