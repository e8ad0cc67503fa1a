#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use audit_pool::browser::{BrowserLauncher, LaunchOptions, LaunchedBrowser};
use audit_pool::config::Config;
use audit_pool::error::{AuditError, LaunchError, SupervisorError};
use audit_pool::infrastructure::AuditEngine;
use audit_pool::models::{AuditJob, Metrics};
use audit_pool::services::{MemoryProbe, MemoryReading};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// 记录存活进程的启动器替身
#[derive(Default)]
pub struct MockLauncher {
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    pub launched: AtomicUsize,
    pub killed: AtomicUsize,
}

impl MockLauncher {
    pub fn alive_count(&self) -> usize {
        self.alive.lock().unwrap().len()
    }
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, _options: &LaunchOptions) -> Result<LaunchedBrowser, LaunchError> {
        let pid = 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid);
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedBrowser {
            process_id: pid,
            endpoint: format!("ws://127.0.0.1:9222/devtools/browser/{pid}"),
        })
    }

    async fn kill(&self, process_id: u32) -> Result<(), SupervisorError> {
        if self.alive.lock().unwrap().remove(&process_id) {
            self.killed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// 一次审计调用的预设行为
#[derive(Debug, Clone)]
pub struct Step {
    pub delay: Duration,
    pub result: Result<f64, AuditError>,
}

impl Step {
    pub fn ok(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: Ok(0.9),
        }
    }

    pub fn err(delay_ms: u64, error: AuditError) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            result: Err(error),
        }
    }
}

/// 按 URL 预设结果的审计引擎，脚本用完后按默认行为成功
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    default_step: Step,
    early_termination: bool,
    calls: Mutex<Vec<(String, Instant)>>,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(default_delay_ms: u64) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_step: Step::ok(default_delay_ms),
            early_termination: false,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn with_early_termination(mut self) -> Self {
        self.early_termination = true;
        self
    }

    pub fn script(self, url: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into());
        self
    }

    /// 某个 URL 每次调用的开始时间
    pub fn call_times(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditEngine for ScriptedEngine {
    async fn audit(&self, url: &str, _endpoint: &str) -> Result<Metrics, AuditError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_step.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        tokio::time::sleep(step.delay).await;
        step.result.map(|score| {
            let mut metrics = Metrics::new();
            metrics.insert("performance".to_string(), score);
            metrics
        })
    }

    fn supports_early_termination(&self) -> bool {
        self.early_termination
    }
}

/// 固定内存读数
pub struct FixedMemoryProbe {
    pub used_bytes: u64,
}

impl MemoryProbe for FixedMemoryProbe {
    fn read(&self) -> anyhow::Result<MemoryReading> {
        Ok(MemoryReading {
            used_bytes: self.used_bytes,
            free_bytes: (16 * GIB).saturating_sub(self.used_bytes),
        })
    }
}

pub fn low_memory() -> Arc<FixedMemoryProbe> {
    Arc::new(FixedMemoryProbe { used_bytes: GIB })
}

/// 测试用配置：无抖动、无状态目录、不写日志文件
pub fn test_config(max: usize, min: usize) -> Config {
    let mut config = Config::default();
    config.pool.max_concurrency = max;
    config.pool.min_concurrency = min;
    config.pool.initial_concurrency = None;
    config.pool.memory_high_watermark_bytes = 8 * GIB;
    config.pool.window_size = 4;
    config.retry.max_attempts = 3;
    config.retry.backoff_base_ms = 100;
    config.retry.backoff_jitter_ms = 0;
    config.memory.sample_interval_ms = 500;
    config.engine.attempt_timeout_ms = 60_000;
    config.grace_period_ms = 5_000;
    config.state_dir = None;
    config.output_log_file = String::new();
    config
}

pub fn jobs(count: usize) -> Vec<AuditJob> {
    (0..count)
        .map(|i| AuditJob::new(format!("job-{}", i + 1), url(i + 1), i))
        .collect()
}

pub fn url(n: usize) -> String {
    format!("https://example.com/page-{n}")
}
