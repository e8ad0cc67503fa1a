//! 自适应工作池 - 编排层
//!
//! ## 职责
//!
//! 一个控制循环是并发状态（允许并发数、已占用槽位、结果窗口）的唯一写者：
//!
//! 1. 按计划顺序把就绪任务派发到空闲槽位，直到占用数达到允许并发数
//! 2. 每个执行结果回来后立即分类、决定重试或终结，然后重算并发数
//! 3. 退避中的任务带着到期时间留在循环里，到期后重新进入就绪队列
//! 4. 取消时停止派发，给进行中的执行一个宽限期，之后强制释放所有浏览器
//! 5. 内存采样到达时立即重算；并发数降到占用数以下时，打断最新派发的执行并让任务重新排队
//!
//! 槽位任务只执行 [`AttemptFlow`]，把结果交回控制循环，不修改任何共享状态。

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{AuditError, ErrorKind, RunError};
use crate::models::{AuditJob, AuditOutcome, AuditResult, JobId, JobState};
use crate::orchestrator::pool_state::{
    ConcurrencyChange, ControlSignals, PoolSnapshot, PoolState, WindowOutcome, WorkerSlot,
};
use crate::services::{
    FinalizeReason, MemoryPressure, ProcessSupervisor, ProgressEvent, ProgressSender,
    RetryController, RetryDecision,
};
use crate::workflow::{AttemptCtx, AttemptFlow, AttemptOutcome};

/// 强制释放后等待槽位任务退出的时间
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// 工作池运行统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub dispatched_attempts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retries: usize,
    pub shrink_events: usize,
    pub grow_events: usize,
    pub final_concurrency: usize,
    pub min_observed_concurrency: usize,
    pub max_observed_concurrency: usize,
    pub peak_occupied: usize,
    /// 宽限期结束时强制释放的浏览器数量
    pub forced_releases: usize,
}

/// 工作池
pub struct WorkerPool {
    config: PoolConfig,
    retry: RetryController,
    flow: Arc<AttemptFlow>,
    supervisor: ProcessSupervisor,
    pressure: watch::Receiver<MemoryPressure>,
    progress: ProgressSender,
    snapshot: Arc<watch::Sender<PoolSnapshot>>,
    grace_period: Duration,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        retry: RetryController,
        flow: AttemptFlow,
        supervisor: ProcessSupervisor,
        pressure: watch::Receiver<MemoryPressure>,
        progress: ProgressSender,
        grace_period: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(PoolSnapshot::default());
        Self {
            config,
            retry,
            flow: Arc::new(flow),
            supervisor,
            pressure,
            progress,
            snapshot: Arc::new(snapshot),
            grace_period,
        }
    }

    /// 使用外部提供的快照通道
    pub fn with_snapshot(mut self, snapshot: Arc<watch::Sender<PoolSnapshot>>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshot.subscribe()
    }

    /// 提交任务并在后台启动控制循环
    ///
    /// 每个任务恰好产生一个终态结果，通过 [`PoolRun::next_result`] 按完成顺序取出。
    pub fn submit(self, jobs: Vec<AuditJob>, cancel: CancellationToken) -> PoolRun {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let slots = (0..self.config.max_concurrency).map(WorkerSlot::new).collect();
        let state = PoolState::new(&self.config);
        let allowed = state.allowed();

        let control = ControlLoop {
            ready: jobs.into_iter().map(|job| (job.plan_index, job)).collect(),
            delayed: Vec::new(),
            running: HashMap::new(),
            preempted: HashMap::new(),
            next_seq: 0,
            pressure_open: true,
            in_flight: JoinSet::new(),
            slots,
            occupied: 0,
            state,
            results: results_tx,
            cancel: cancel.clone(),
            hard_stop: CancellationToken::new(),
            draining: false,
            grace_deadline: None,
            reap_deadline: None,
            report: PoolReport {
                min_observed_concurrency: allowed,
                max_observed_concurrency: allowed,
                ..PoolReport::default()
            },
            pool: self,
        };

        PoolRun {
            results: results_rx,
            cancel,
            task: tokio::spawn(control.run()),
        }
    }
}

/// 一次提交的句柄
pub struct PoolRun {
    results: mpsc::UnboundedReceiver<AuditResult>,
    cancel: CancellationToken,
    task: JoinHandle<PoolReport>,
}

impl PoolRun {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 下一个终态结果；全部结束后返回 `None`
    pub async fn next_result(&mut self) -> Option<AuditResult> {
        self.results.recv().await
    }

    pub async fn join(self) -> Result<PoolReport, RunError> {
        self.task
            .await
            .map_err(|e| RunError::PoolTaskFailed(e.to_string()))
    }
}

struct DelayedJob {
    due: Instant,
    job: AuditJob,
}

struct SlotReport {
    plan_index: usize,
    outcome: AttemptOutcome,
}

/// 执行中的任务
struct RunningJob {
    job: AuditJob,
    slot_id: usize,
    /// 派发顺序，收缩时从最新的开始打断
    seq: u64,
    stop: CancellationToken,
}

struct ControlLoop {
    pool: WorkerPool,
    state: PoolState,
    slots: Vec<WorkerSlot>,
    occupied: usize,
    /// 按计划顺序排列的就绪任务
    ready: BTreeMap<usize, AuditJob>,
    delayed: Vec<DelayedJob>,
    running: HashMap<usize, RunningJob>,
    /// 已让出槽位、等待槽位任务退出的任务
    preempted: HashMap<usize, AuditJob>,
    next_seq: u64,
    pressure_open: bool,
    in_flight: JoinSet<SlotReport>,
    results: mpsc::UnboundedSender<AuditResult>,
    cancel: CancellationToken,
    hard_stop: CancellationToken,
    draining: bool,
    grace_deadline: Option<Instant>,
    reap_deadline: Option<Instant>,
    report: PoolReport,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ControlLoop {
    async fn run(mut self) -> PoolReport {
        info!(
            "🏊 工作池启动: {} 个任务, 初始并发 {} (范围 {}-{})",
            self.ready.len(),
            self.state.allowed(),
            self.pool.config.min_concurrency,
            self.pool.config.max_concurrency
        );

        // 派发前先按当前内存读数收缩
        let memory = *self.pool.pressure.borrow_and_update();
        loop {
            match self.state.on_memory(&memory) {
                ConcurrencyChange::Unchanged => break,
                change => self.apply_change(change),
            }
        }

        loop {
            if !self.draining && self.cancel.is_cancelled() {
                self.begin_drain();
            }
            self.promote_due_retries();
            if !self.draining {
                self.dispatch_ready();
            }
            self.publish_snapshot();

            if self.is_finished() {
                break;
            }

            let next_due = self.delayed.iter().map(|d| d.due).min();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.draining => self.begin_drain(),
                _ = sleep_until_opt(self.grace_deadline), if self.grace_deadline.is_some() => {
                    self.force_release().await;
                }
                _ = sleep_until_opt(self.reap_deadline), if self.reap_deadline.is_some() => {
                    self.abandon_in_flight();
                }
                changed = self.pool.pressure.changed(), if self.pressure_open => {
                    match changed {
                        Ok(()) => self.on_memory_sample(),
                        Err(_) => self.pressure_open = false,
                    }
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match joined {
                        Ok(report) => self.on_slot_report(report),
                        Err(e) => error!("❌ 执行槽位任务异常: {}", e),
                    }
                }
                _ = sleep_until_opt(next_due), if next_due.is_some() => {}
                else => {
                    warn!("⚠️ 控制循环没有可等待的事件，结束运行");
                    break;
                }
            }
        }

        self.finalize_leftovers();
        self.report.final_concurrency = self.state.allowed();
        self.publish_snapshot();
        info!(
            "🏁 工作池结束: 成功 {}, 失败 {}, 取消 {}, 重试 {}",
            self.report.succeeded, self.report.failed, self.report.cancelled, self.report.retries
        );
        self.report
    }

    fn is_finished(&self) -> bool {
        self.ready.is_empty()
            && self.delayed.is_empty()
            && self.running.is_empty()
            && self.preempted.is_empty()
            && self.in_flight.is_empty()
    }

    fn promote_due_retries(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].due <= now {
                let DelayedJob { job, .. } = self.delayed.swap_remove(i);
                debug!("[任务 {}] ⏰ 退避结束，重新排队", job.id);
                self.ready.insert(job.plan_index, job);
            } else {
                i += 1;
            }
        }
    }

    fn dispatch_ready(&mut self) {
        while self.occupied < self.state.allowed() {
            let Some(slot_id) = self.slots.iter().position(WorkerSlot::is_free) else {
                break;
            };
            let Some((_, mut job)) = self.ready.pop_first() else {
                break;
            };

            let attempt = job.begin_attempt();
            let ctx = AttemptCtx::new(
                job.id.clone(),
                job.url.clone(),
                job.plan_index,
                attempt,
                slot_id,
            );
            self.slots[slot_id].current_job = Some(job.id.clone());
            self.occupied += 1;
            self.report.dispatched_attempts += 1;
            self.report.peak_occupied = self.report.peak_occupied.max(self.occupied);
            debug_assert!(self.occupied <= self.state.allowed());

            self.pool.progress.notify(ProgressEvent::Started {
                job_id: job.id.clone(),
                attempt,
                slot_id,
            });
            let stop = self.hard_stop.child_token();
            self.next_seq += 1;
            self.running.insert(
                job.plan_index,
                RunningJob {
                    job,
                    slot_id,
                    seq: self.next_seq,
                    stop: stop.clone(),
                },
            );

            let flow = self.pool.flow.clone();
            let soft_cancel = self.cancel.clone();
            self.in_flight.spawn(async move {
                let outcome = AssertUnwindSafe(flow.run(&ctx, &soft_cancel, &stop))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!("{} ❌ 执行过程中发生 panic", ctx);
                        AttemptOutcome::Failed(
                            AuditError::Engine("执行过程中发生 panic".to_string()).into(),
                        )
                    });
                SlotReport {
                    plan_index: ctx.plan_index,
                    outcome,
                }
            });
        }
    }

    fn on_slot_report(&mut self, report: SlotReport) {
        if let Some(job) = self.preempted.remove(&report.plan_index) {
            self.on_preempted_report(job, report.outcome);
            return;
        }

        let Some(entry) = self.running.remove(&report.plan_index) else {
            warn!("⚠️ 收到未知任务的执行结果 (计划序号 {})", report.plan_index);
            return;
        };
        if let Some(slot) = self.slots.get_mut(entry.slot_id) {
            slot.current_job = None;
        }
        self.occupied = self.occupied.saturating_sub(1);
        self.settle(entry.job, report.outcome);
    }

    /// 被打断的执行不计入窗口，也不消耗执行次数
    fn on_preempted_report(&mut self, mut job: AuditJob, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Interrupted if self.draining => {
                job.finish(JobState::Cancelled);
                let result = AuditResult::cancelled(&job, "执行被取消");
                self.emit_final(result, None);
            }
            AttemptOutcome::Interrupted => {
                job.yield_attempt();
                debug!("[任务 {}] ↩ 已让出槽位，重新排队", job.id);
                self.ready.insert(job.plan_index, job);
            }
            // 打断前已经结束的执行照常处理
            outcome => self.settle(job, outcome),
        }
    }

    /// 分类一次执行的结果，决定终结或重试，然后重算并发数
    fn settle(&mut self, mut job: AuditJob, outcome: AttemptOutcome) {
        let mut resource_exhausted = false;
        match outcome {
            AttemptOutcome::Completed(metrics) => {
                self.state.record(WindowOutcome::Success);
                job.finish(JobState::Succeeded);
                let result = AuditResult::succeeded(&job, metrics);
                self.emit_final(result, None);
            }
            AttemptOutcome::Interrupted => {
                job.finish(JobState::Cancelled);
                let result = AuditResult::cancelled(&job, "执行被取消");
                self.emit_final(result, None);
            }
            AttemptOutcome::Failed(error) => {
                let kind = error.kind();
                resource_exhausted = kind == ErrorKind::Resource;
                // 资源错误只触发收缩，不计入失败率
                if !resource_exhausted {
                    self.state.record(WindowOutcome::Failure);
                }

                match self.pool.retry.on_outcome(&job, &error) {
                    RetryDecision::Requeue {
                        delay,
                        classification,
                    } if !self.draining => {
                        job.await_retry();
                        self.report.retries += 1;
                        self.pool.progress.notify(ProgressEvent::Retried {
                            job_id: job.id.clone(),
                            attempt: job.attempt(),
                            delay_ms: delay.as_millis() as u64,
                            classification,
                            error: error.to_string(),
                        });
                        self.delayed.push(DelayedJob {
                            due: Instant::now() + delay,
                            job,
                        });
                    }
                    RetryDecision::Requeue { .. } => {
                        job.finish(JobState::Cancelled);
                        let result = AuditResult::cancelled(&job, "运行已取消，放弃重试");
                        self.emit_final(result, None);
                    }
                    RetryDecision::Finalize { reason } => {
                        job.finish(JobState::FailedPermanent);
                        let result = AuditResult::failed(&job, kind, error.to_string());
                        self.emit_final(result, Some(reason));
                    }
                }
            }
        }

        let signals = ControlSignals {
            memory: *self.pool.pressure.borrow(),
            resource_exhausted,
        };
        let change = self.state.recompute(&signals);
        self.apply_change(change);
    }

    fn on_memory_sample(&mut self) {
        let memory = *self.pool.pressure.borrow_and_update();
        let change = self.state.on_memory(&memory);
        self.apply_change(change);
    }

    fn apply_change(&mut self, change: ConcurrencyChange) {
        let (from, to, reason) = match change {
            ConcurrencyChange::Unchanged => return,
            ConcurrencyChange::Shrunk { from, to, reason } => {
                self.report.shrink_events += 1;
                if self.occupied > to {
                    self.preempt_excess();
                }
                (from, to, reason.to_string())
            }
            ConcurrencyChange::Grew { from, to } => {
                self.report.grow_events += 1;
                (from, to, "window_healthy".to_string())
            }
        };
        self.report.min_observed_concurrency = self.report.min_observed_concurrency.min(to);
        self.report.max_observed_concurrency = self.report.max_observed_concurrency.max(to);
        self.pool
            .progress
            .notify(ProgressEvent::ConcurrencyChanged { from, to, reason });
    }

    /// 占用数超过允许并发数时，从最新派发的执行开始打断，空出的槽位立即归还
    fn preempt_excess(&mut self) {
        while self.occupied > self.state.allowed() {
            let newest = self
                .running
                .iter()
                .max_by_key(|(_, entry)| entry.seq)
                .map(|(index, _)| *index);
            let Some(entry) = newest.and_then(|index| self.running.remove(&index)) else {
                break;
            };

            entry.stop.cancel();
            if let Some(slot) = self.slots.get_mut(entry.slot_id) {
                slot.current_job = None;
            }
            self.occupied -= 1;
            warn!(
                "[任务 {}] ⏸ 并发下调到 {}，打断执行并重新排队",
                entry.job.id,
                self.state.allowed()
            );
            self.preempted.insert(entry.job.plan_index, entry.job);
        }
    }

    /// 发送终态结果并更新统计
    fn emit_final(&mut self, result: AuditResult, reason: Option<FinalizeReason>) {
        let job_id = result.job_id.clone();
        let attempts = result.attempts_used;
        let event = match (&result.state, &result.outcome) {
            (JobState::Succeeded, _) => {
                self.report.succeeded += 1;
                ProgressEvent::Succeeded {
                    job_id,
                    attempts,
                    duration_ms: result.duration_ms,
                }
            }
            (JobState::FailedPermanent, AuditOutcome::Failure { error_kind, message }) => {
                self.report.failed += 1;
                ProgressEvent::FailedPermanent {
                    job_id,
                    attempts,
                    error_kind: *error_kind,
                    reason: reason.unwrap_or(FinalizeReason::Fatal),
                    message: message.clone(),
                }
            }
            _ => {
                self.report.cancelled += 1;
                ProgressEvent::Cancelled { job_id, attempts }
            }
        };
        self.pool.progress.notify(event);

        if self.results.send(result).is_err() {
            debug!("结果接收端已关闭");
        }
    }

    /// 进入排空阶段：停止派发，排队和退避中的任务直接取消
    fn begin_drain(&mut self) {
        self.draining = true;
        warn!(
            "⏹ 收到取消信号: 停止派发, {} 个执行中的任务有 {}ms 宽限期",
            self.running.len(),
            self.pool.grace_period.as_millis()
        );

        let queued: Vec<AuditJob> = std::mem::take(&mut self.ready).into_values().collect();
        let delayed: Vec<AuditJob> = self.delayed.drain(..).map(|d| d.job).collect();
        let mut pending: Vec<AuditJob> = queued.into_iter().chain(delayed).collect();
        pending.sort_by_key(|job| job.plan_index);
        for mut job in pending {
            job.finish(JobState::Cancelled);
            let result = AuditResult::cancelled(&job, "运行已取消");
            self.emit_final(result, None);
        }

        if !self.in_flight.is_empty() {
            self.grace_deadline = Some(Instant::now() + self.pool.grace_period);
        }
    }

    /// 宽限期结束：打断所有执行并强制释放浏览器
    async fn force_release(&mut self) {
        self.grace_deadline = None;
        warn!("⏱ 宽限期结束，强制结束 {} 个执行", self.running.len());
        self.hard_stop.cancel();
        self.report.forced_releases += self.pool.supervisor.release_all().await;
        self.reap_deadline = Some(Instant::now() + REAP_TIMEOUT);
    }

    /// 槽位任务在打断后仍未退出，直接中止并取消对应任务
    fn abandon_in_flight(&mut self) {
        self.reap_deadline = None;
        if self.in_flight.is_empty() {
            return;
        }
        error!("❌ {} 个执行槽位未能按时退出，强制中止", self.in_flight.len());
        self.in_flight.abort_all();
        self.in_flight = JoinSet::new();
        for slot in &mut self.slots {
            slot.current_job = None;
        }
        self.occupied = 0;

        let mut running: Vec<AuditJob> = self
            .running
            .drain()
            .map(|(_, entry)| entry.job)
            .chain(self.preempted.drain().map(|(_, job)| job))
            .collect();
        running.sort_by_key(|job| job.plan_index);
        for mut job in running {
            job.finish(JobState::Cancelled);
            let result = AuditResult::cancelled(&job, "执行被强制中止");
            self.emit_final(result, None);
        }
    }

    /// 循环异常退出时兜底：所有未终结的任务都记为取消
    fn finalize_leftovers(&mut self) {
        let mut leftovers: Vec<AuditJob> = std::mem::take(&mut self.ready).into_values().collect();
        leftovers.extend(self.delayed.drain(..).map(|d| d.job));
        leftovers.extend(self.running.drain().map(|(_, entry)| entry.job));
        leftovers.extend(self.preempted.drain().map(|(_, job)| job));
        if leftovers.is_empty() {
            return;
        }

        warn!("⚠️ {} 个任务未完成，记为取消", leftovers.len());
        leftovers.sort_by_key(|job| job.plan_index);
        for mut job in leftovers {
            job.finish(JobState::Cancelled);
            let result = AuditResult::cancelled(&job, "运行提前结束");
            self.emit_final(result, None);
        }
    }

    fn publish_snapshot(&self) {
        let memory = *self.pool.pressure.borrow();
        let mut running: Vec<(usize, JobId)> = self
            .running
            .iter()
            .map(|(index, entry)| (*index, entry.job.id.clone()))
            .collect();
        running.sort_by_key(|(index, _)| *index);

        self.pool.snapshot.send_replace(PoolSnapshot {
            allowed_concurrency: self.state.allowed(),
            min_concurrency: self.pool.config.min_concurrency,
            max_concurrency: self.pool.config.max_concurrency,
            occupied: self.occupied,
            queued: self.ready.len(),
            awaiting_retry: self.delayed.len(),
            running: running.into_iter().map(|(_, id)| id).collect(),
            succeeded: self.report.succeeded,
            failed: self.report.failed,
            cancelled: self.report.cancelled,
            failure_rate: self.state.window().failure_rate(),
            memory_used_bytes: memory.used_bytes,
            memory_level: memory.level,
            draining: self.draining,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserLauncher, LaunchOptions, LaunchedBrowser};
    use crate::config::RetryPolicy;
    use crate::error::{LaunchError, SupervisorError};
    use crate::infrastructure::AuditEngine;
    use crate::models::Metrics;
    use crate::services::progress_reporter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    #[derive(Default)]
    struct InstantLauncher {
        next: AtomicU32,
    }

    #[async_trait]
    impl BrowserLauncher for InstantLauncher {
        async fn launch(&self, _options: &LaunchOptions) -> Result<LaunchedBrowser, LaunchError> {
            Ok(LaunchedBrowser {
                process_id: 100 + self.next.fetch_add(1, Ordering::SeqCst),
                endpoint: "ws://127.0.0.1:9/devtools".into(),
            })
        }

        async fn kill(&self, _process_id: u32) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    /// URL 末尾的数字就是审计耗时（秒）
    struct SleepyEngine;

    #[async_trait]
    impl AuditEngine for SleepyEngine {
        async fn audit(&self, url: &str, _endpoint: &str) -> Result<Metrics, AuditError> {
            let secs: u64 = url.rsplit('/').next().and_then(|s| s.parse().ok()).unwrap_or(1);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok(Metrics::new())
        }
    }

    fn pool(max: usize) -> (WorkerPool, JoinHandle<crate::services::RunSummary>) {
        let (pool, _pressure_tx, reporter) = pool_with_pressure(max);
        (pool, reporter)
    }

    fn pool_with_pressure(
        max: usize,
    ) -> (
        WorkerPool,
        watch::Sender<MemoryPressure>,
        JoinHandle<crate::services::RunSummary>,
    ) {
        let config = PoolConfig {
            max_concurrency: max,
            ..PoolConfig::default()
        };
        let supervisor = ProcessSupervisor::new(Arc::new(InstantLauncher::default()), "run-test", max, None);
        let flow = AttemptFlow::new(supervisor.clone(), Arc::new(SleepyEngine), Duration::from_secs(60));
        let retry = RetryController::new(RetryPolicy {
            backoff_jitter_ms: 0,
            ..RetryPolicy::default()
        });
        let (pressure_tx, pressure) = watch::channel(MemoryPressure::default());
        let (subscribers, _) = broadcast::channel(64);
        let (progress, reporter) = progress_reporter::channel(subscribers);
        let pool = WorkerPool::new(
            config,
            retry,
            flow,
            supervisor,
            pressure,
            progress,
            Duration::from_secs(30),
        );
        (pool, pressure_tx, reporter.spawn())
    }

    fn job(index: usize, secs: u64) -> AuditJob {
        AuditJob::new(format!("job-{index}"), format!("https://example.com/{secs}"), index)
    }

    #[tokio::test(start_paused = true)]
    async fn results_arrive_in_completion_order() {
        let (pool, _reporter) = pool(3);
        let mut run = pool.submit(vec![job(0, 5), job(1, 1), job(2, 3)], CancellationToken::new());

        let mut order = Vec::new();
        while let Some(result) = run.next_result().await {
            assert_eq!(result.state, JobState::Succeeded);
            order.push(result.plan_index);
        }
        assert_eq!(order, vec![1, 2, 0]);

        let report = run.join().await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.peak_occupied, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_dispatches_nothing() {
        let (pool, _reporter) = pool(2);
        let mut run = pool.submit(vec![job(0, 1), job(1, 1)], CancellationToken::new());
        run.cancel();

        let mut cancelled = 0;
        while let Some(result) = run.next_result().await {
            assert_eq!(result.state, JobState::Cancelled);
            assert_eq!(result.attempts_used, 0);
            cancelled += 1;
        }
        assert_eq!(cancelled, 2);
        assert_eq!(run.join().await.unwrap().dispatched_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_sample_between_completions_reclaims_newest_slots() {
        let (pool, pressure_tx, _reporter) = pool_with_pressure(4);
        let watermark = pool.config.memory_high_watermark_bytes;
        let mut snapshots = pool.watch_snapshot();
        let jobs = (0..4).map(|i| job(i, 10)).collect();
        let mut run = pool.submit(jobs, CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(snapshots.borrow_and_update().occupied, 4);

        // 没有任何执行结束，内存读数本身就要触发收缩
        pressure_tx.send_replace(MemoryPressure {
            used_bytes: watermark,
            ..MemoryPressure::default()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.allowed_concurrency, 2);
        assert_eq!(snapshot.occupied, 2);
        assert_eq!(snapshot.queued, 2);
        assert_eq!(snapshot.running, vec![JobId::new("job-0"), JobId::new("job-1")]);

        pressure_tx.send_replace(MemoryPressure::default());
        let mut results = Vec::new();
        while let Some(result) = run.next_result().await {
            results.push(result);
        }
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.state == JobState::Succeeded));
        assert!(results.iter().all(|r| r.attempts_used == 1));

        let report = run.join().await.unwrap();
        assert_eq!(report.shrink_events, 1);
        assert_eq!(report.dispatched_attempts, 6);
        assert_eq!(report.peak_occupied, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn high_memory_at_start_limits_first_dispatch() {
        let (pool, pressure_tx, _reporter) = pool_with_pressure(4);
        pressure_tx.send_replace(MemoryPressure {
            used_bytes: pool.config.memory_high_watermark_bytes,
            ..MemoryPressure::default()
        });
        let jobs = (0..4).map(|i| job(i, 1)).collect();
        let mut run = pool.submit(jobs, CancellationToken::new());

        while run.next_result().await.is_some() {}
        let report = run.join().await.unwrap();
        assert_eq!(report.peak_occupied, 1);
        assert_eq!(report.final_concurrency, 1);
        assert_eq!(report.succeeded, 4);
    }
}
