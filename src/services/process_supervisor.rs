//! 进程监管 - 业务能力层
//!
//! 浏览器进程的唯一所有者：
//! - `acquire` 为一次执行启动独立浏览器，登记到以任务 ID 为键的注册表
//! - `release` 幂等地终止进程并注销句柄
//! - `sweep_orphans` 在运行开始和结束时清理遗留进程
//!
//! 每次 `acquire` 得到一个 [`BrowserLease`]，持有者在所有退出路径上负责归还；
//! 租约被直接丢弃时会在后台补做释放。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserLauncher, LaunchOptions};
use crate::error::LaunchError;
use crate::models::JobId;
use crate::services::process_ledger::{LedgerEntry, ProcessLedger};

/// 浏览器句柄，只属于一个任务的一次执行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserHandle {
    pub process_id: u32,
    pub debug_endpoint: String,
    pub owner_job_id: JobId,
    pub attempt: u32,
    pub launched_at: DateTime<Utc>,
}

/// 孤儿清理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub found: usize,
    pub terminated: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Registry {
    handles: HashMap<JobId, BrowserHandle>,
    /// 正在启动中的任务，计入容量
    launching: HashSet<JobId>,
}

struct SupervisorInner {
    launcher: Arc<dyn BrowserLauncher>,
    run_id: String,
    capacity: usize,
    registry: Mutex<Registry>,
    /// 终止失败、等待下次清理的 pid
    pending_kills: Mutex<BTreeSet<u32>>,
    ledger: Option<Mutex<ProcessLedger>>,
}

/// 进程监管器
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        run_id: impl Into<String>,
        capacity: usize,
        ledger: Option<ProcessLedger>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                launcher,
                run_id: run_id.into(),
                capacity: capacity.max(1),
                registry: Mutex::new(Registry::default()),
                pending_kills: Mutex::new(BTreeSet::new()),
                ledger: ledger.map(Mutex::new),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// 为一次执行启动浏览器
    pub async fn acquire(&self, job_id: &JobId, attempt: u32) -> Result<BrowserLease, LaunchError> {
        let reservation = self.reserve(job_id)?;

        let options = LaunchOptions {
            job_id: job_id.clone(),
            attempt,
            run_id: self.inner.run_id.clone(),
        };
        let launched = self.inner.launcher.launch(&options).await?;

        let handle = BrowserHandle {
            process_id: launched.process_id,
            debug_endpoint: launched.endpoint,
            owner_job_id: job_id.clone(),
            attempt,
            launched_at: Utc::now(),
        };
        {
            let mut registry = lock(&self.inner.registry);
            registry.launching.remove(job_id);
            registry.handles.insert(job_id.clone(), handle.clone());
        }
        reservation.disarm();
        self.ledger_record(&handle);

        info!(
            "[任务 {}] 🌐 浏览器已启动 (pid {}, 第 {} 次执行)",
            job_id, handle.process_id, attempt
        );
        Ok(BrowserLease {
            supervisor: self.clone(),
            handle,
            released: false,
        })
    }

    fn reserve(&self, job_id: &JobId) -> Result<LaunchReservation, LaunchError> {
        let mut registry = lock(&self.inner.registry);
        if registry.handles.contains_key(job_id) || registry.launching.contains(job_id) {
            return Err(LaunchError::HandleAlreadyHeld {
                job_id: job_id.to_string(),
            });
        }
        let live = registry.handles.len() + registry.launching.len();
        if live >= self.inner.capacity {
            return Err(LaunchError::CapacityExhausted {
                live,
                limit: self.inner.capacity,
            });
        }
        registry.launching.insert(job_id.clone());
        Ok(LaunchReservation {
            supervisor: self.clone(),
            job_id: Some(job_id.clone()),
        })
    }

    /// 终止进程并注销句柄；重复释放是空操作
    ///
    /// 返回本次调用是否真正注销了句柄
    pub async fn release(&self, handle: &BrowserHandle) -> bool {
        let removed = {
            let mut registry = lock(&self.inner.registry);
            match registry.handles.get(&handle.owner_job_id) {
                Some(held) if held.process_id == handle.process_id => {
                    registry.handles.remove(&handle.owner_job_id);
                    true
                }
                _ => false,
            }
        };
        if !removed {
            debug!(
                "[任务 {}] 浏览器 pid {} 已释放，跳过",
                handle.owner_job_id, handle.process_id
            );
            return false;
        }

        if self.terminate(handle.process_id).await {
            debug!(
                "[任务 {}] 🧹 浏览器 pid {} 已终止",
                handle.owner_job_id, handle.process_id
            );
        }
        true
    }

    /// 强制释放所有存活句柄，返回释放数量
    pub async fn release_all(&self) -> usize {
        let handles: Vec<BrowserHandle> = {
            let mut registry = lock(&self.inner.registry);
            registry.handles.drain().map(|(_, h)| h).collect()
        };
        if handles.is_empty() {
            return 0;
        }

        warn!("⚠️ 强制释放 {} 个浏览器句柄", handles.len());
        for handle in &handles {
            self.terminate(handle.process_id).await;
        }
        handles.len()
    }

    /// 清理上次运行遗留的进程以及之前终止失败的进程
    pub async fn sweep_orphans(&self) -> SweepReport {
        let live: HashSet<u32> = lock(&self.inner.registry)
            .handles
            .values()
            .map(|h| h.process_id)
            .collect();

        let mut candidates = std::mem::take(&mut *lock(&self.inner.pending_kills));
        if let Some(ledger) = &self.inner.ledger {
            match lock(ledger).load() {
                Ok(entries) => candidates.extend(entries.into_iter().map(|e| e.pid)),
                Err(e) => warn!("⚠️ 读取进程台账失败: {}", e),
            }
        }
        candidates.retain(|pid| !live.contains(pid));

        let mut report = SweepReport {
            found: candidates.len(),
            ..SweepReport::default()
        };
        for pid in candidates {
            if self.terminate(pid).await {
                report.terminated += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.found > 0 {
            info!(
                "🧹 孤儿进程清理: 发现 {}, 已终止 {}, 失败 {}",
                report.found, report.terminated, report.failed
            );
        } else {
            debug!("🧹 孤儿进程清理: 未发现遗留进程");
        }
        report
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.registry).handles.len()
    }

    pub fn live_handles(&self) -> Vec<BrowserHandle> {
        lock(&self.inner.registry).handles.values().cloned().collect()
    }

    /// 等待下次清理的 pid 数量
    pub fn pending_kill_count(&self) -> usize {
        lock(&self.inner.pending_kills).len()
    }

    /// 终止失败只记录日志并留待下次清理，不影响任务结果
    async fn terminate(&self, pid: u32) -> bool {
        match self.inner.launcher.kill(pid).await {
            Ok(()) => {
                lock(&self.inner.pending_kills).remove(&pid);
                self.ledger_remove(pid);
                true
            }
            Err(e) => {
                warn!("⚠️ {} [{}]，将在下次清理时重试", e, e.kind());
                lock(&self.inner.pending_kills).insert(pid);
                false
            }
        }
    }

    fn ledger_record(&self, handle: &BrowserHandle) {
        if let Some(ledger) = &self.inner.ledger {
            let entry = LedgerEntry {
                pid: handle.process_id,
                job_id: handle.owner_job_id.clone(),
                attempt: handle.attempt,
                run_id: self.inner.run_id.clone(),
                launched_at: handle.launched_at,
            };
            if let Err(e) = lock(ledger).record(entry) {
                warn!("⚠️ 写入进程台账失败: {}", e);
            }
        }
    }

    fn ledger_remove(&self, pid: u32) {
        if let Some(ledger) = &self.inner.ledger {
            if let Err(e) = lock(ledger).remove(pid) {
                warn!("⚠️ 更新进程台账失败: {}", e);
            }
        }
    }
}

/// 启动中的容量预留，启动被中断时自动归还
struct LaunchReservation {
    supervisor: ProcessSupervisor,
    job_id: Option<JobId>,
}

impl LaunchReservation {
    fn disarm(mut self) {
        self.job_id = None;
    }
}

impl Drop for LaunchReservation {
    fn drop(&mut self) {
        if let Some(job_id) = self.job_id.take() {
            lock(&self.supervisor.inner.registry).launching.remove(&job_id);
        }
    }
}

/// 浏览器租约
///
/// 持有者应显式调用 [`BrowserLease::release`]；未释放就被丢弃时，
/// 在当前 tokio 运行时上补做释放，没有运行时则交给下次清理。
pub struct BrowserLease {
    supervisor: ProcessSupervisor,
    handle: BrowserHandle,
    released: bool,
}

impl BrowserLease {
    pub fn handle(&self) -> &BrowserHandle {
        &self.handle
    }

    pub async fn release(mut self) {
        self.released = true;
        self.supervisor.release(&self.handle).await;
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            "[任务 {}] ⚠️ 浏览器租约未显式释放 (pid {})，后台补做释放",
            self.handle.owner_job_id, self.handle.process_id
        );
        let supervisor = self.supervisor.clone();
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    supervisor.release(&handle).await;
                });
            }
            Err(_) => {
                error!(
                    "[任务 {}] ❌ 没有可用的运行时，pid {} 留待下次清理",
                    handle.owner_job_id, handle.process_id
                );
                lock(&supervisor.inner.registry)
                    .handles
                    .remove(&handle.owner_job_id);
                lock(&supervisor.inner.pending_kills).insert(handle.process_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::LaunchedBrowser;
    use crate::error::SupervisorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeLauncher {
        next_pid: AtomicU32,
        alive: Mutex<HashSet<u32>>,
        fail_kills: AtomicBool,
    }

    impl FakeLauncher {
        fn alive(&self) -> usize {
            self.alive.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(
            &self,
            _options: &LaunchOptions,
        ) -> Result<LaunchedBrowser, LaunchError> {
            let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().unwrap().insert(pid);
            Ok(LaunchedBrowser {
                process_id: pid,
                endpoint: format!("ws://127.0.0.1/devtools/browser/{pid}"),
            })
        }

        async fn kill(&self, process_id: u32) -> Result<(), SupervisorError> {
            if self.fail_kills.load(Ordering::SeqCst) {
                return Err(SupervisorError::kill_failed(process_id, "permission denied"));
            }
            self.alive.lock().unwrap().remove(&process_id);
            Ok(())
        }
    }

    fn supervisor(capacity: usize) -> (Arc<FakeLauncher>, ProcessSupervisor) {
        let launcher = Arc::new(FakeLauncher::default());
        let supervisor = ProcessSupervisor::new(launcher.clone(), "run-test", capacity, None);
        (launcher, supervisor)
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (launcher, supervisor) = supervisor(2);
        let job = JobId::new("job-1");

        let lease = supervisor.acquire(&job, 1).await.unwrap();
        let handle = lease.handle().clone();
        assert_eq!(supervisor.live_count(), 1);
        assert_eq!(launcher.alive(), 1);

        lease.release().await;
        assert_eq!(supervisor.live_count(), 0);
        assert_eq!(launcher.alive(), 0);
        assert!(!supervisor.release(&handle).await);
    }

    #[tokio::test]
    async fn one_handle_per_job() {
        let (_launcher, supervisor) = supervisor(4);
        let job = JobId::new("job-1");

        let lease = supervisor.acquire(&job, 1).await.unwrap();
        let err = supervisor.acquire(&job, 2).await.err().unwrap();
        assert!(matches!(err, LaunchError::HandleAlreadyHeld { .. }));
        lease.release().await;

        let again = supervisor.acquire(&job, 2).await.unwrap();
        assert_eq!(again.handle().attempt, 2);
        again.release().await;
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (_launcher, supervisor) = supervisor(1);
        let first = supervisor.acquire(&JobId::new("a"), 1).await.unwrap();
        let err = supervisor.acquire(&JobId::new("b"), 1).await.err().unwrap();
        assert!(matches!(
            err,
            LaunchError::CapacityExhausted { live: 1, limit: 1 }
        ));
        first.release().await;
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_background() {
        let (launcher, supervisor) = supervisor(2);
        let lease = supervisor.acquire(&JobId::new("job-1"), 1).await.unwrap();
        drop(lease);

        for _ in 0..10 {
            if launcher.alive() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(launcher.alive(), 0);
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn failed_kill_is_retried_by_sweep() {
        let (launcher, supervisor) = supervisor(2);
        launcher.fail_kills.store(true, Ordering::SeqCst);

        let lease = supervisor.acquire(&JobId::new("job-1"), 1).await.unwrap();
        lease.release().await;
        assert_eq!(supervisor.live_count(), 0);
        assert_eq!(supervisor.pending_kill_count(), 1);
        assert_eq!(launcher.alive(), 1);

        launcher.fail_kills.store(false, Ordering::SeqCst);
        let report = supervisor.sweep_orphans().await;
        assert_eq!(
            report,
            SweepReport {
                found: 1,
                terminated: 1,
                failed: 0
            }
        );
        assert_eq!(launcher.alive(), 0);
        assert_eq!(supervisor.pending_kill_count(), 0);
    }

    #[tokio::test]
    async fn release_all_terminates_everything() {
        let (launcher, supervisor) = supervisor(3);
        let a = supervisor.acquire(&JobId::new("a"), 1).await.unwrap();
        let b = supervisor.acquire(&JobId::new("b"), 1).await.unwrap();

        assert_eq!(supervisor.release_all().await, 2);
        assert_eq!(launcher.alive(), 0);

        // 之后的显式释放是空操作
        a.release().await;
        b.release().await;
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn sweep_kills_ledger_entries_from_previous_run() {
        let dir = std::env::temp_dir().join(format!("audit-pool-sweep-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let ledger = ProcessLedger::in_dir(&dir);
        ledger
            .record(LedgerEntry {
                pid: 4242,
                job_id: JobId::new("old"),
                attempt: 1,
                run_id: "run-previous".into(),
                launched_at: Utc::now(),
            })
            .unwrap();

        let launcher = Arc::new(FakeLauncher::default());
        launcher.alive.lock().unwrap().insert(4242);
        let supervisor = ProcessSupervisor::new(
            launcher.clone(),
            "run-now",
            2,
            Some(ProcessLedger::in_dir(&dir)),
        );

        let report = supervisor.sweep_orphans().await;
        assert_eq!(report.terminated, 1);
        assert_eq!(launcher.alive(), 0);
        assert!(ledger.load().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
