//! 工作池状态
//!
//! 只由控制循环读写：允许并发数、最近结果窗口以及收缩 / 增长规则。
//! 规则本身是纯函数，方便单独测试。

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::PoolConfig;
use crate::models::JobId;
use crate::services::MemoryPressure;

/// 窗口中的一条结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    Success,
    Failure,
}

/// 最近 N 次执行结果
#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    capacity: usize,
    entries: VecDeque<WindowOutcome>,
}

impl OutcomeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, outcome: WindowOutcome) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(outcome);
    }

    /// 窗口内的失败比例，空窗口为 0
    pub fn failure_rate(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let failures = self
            .entries
            .iter()
            .filter(|o| **o == WindowOutcome::Failure)
            .count();
        failures as f64 / self.entries.len() as f64
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == self.capacity
    }

    pub fn all_successes(&self) -> bool {
        self.entries.iter().all(|o| *o == WindowOutcome::Success)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// 收缩原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShrinkReason {
    MemoryPressure,
    FailureRate,
    ResourceExhausted,
}

impl std::fmt::Display for ShrinkReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShrinkReason::MemoryPressure => "memory_pressure",
            ShrinkReason::FailureRate => "failure_rate",
            ShrinkReason::ResourceExhausted => "resource_exhausted",
        };
        f.write_str(name)
    }
}

/// 一次重算的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyChange {
    Unchanged,
    Shrunk {
        from: usize,
        to: usize,
        reason: ShrinkReason,
    },
    Grew {
        from: usize,
        to: usize,
    },
}

/// 控制循环每次重算时看到的信号
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlSignals {
    pub memory: MemoryPressure,
    /// 刚结束的执行报告了资源错误
    pub resource_exhausted: bool,
}

/// 自适应并发状态
#[derive(Debug, Clone)]
pub struct PoolState {
    config: PoolConfig,
    allowed: usize,
    window: OutcomeWindow,
}

impl PoolState {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            config: config.clone(),
            allowed: config.starting_concurrency(),
            window: OutcomeWindow::new(config.window_size),
        }
    }

    pub fn allowed(&self) -> usize {
        self.allowed
    }

    pub fn window(&self) -> &OutcomeWindow {
        &self.window
    }

    pub fn record(&mut self, outcome: WindowOutcome) {
        self.window.record(outcome);
    }

    /// 收缩快、增长慢
    ///
    /// 1. 内存达到水位线、失败率达到阈值或出现资源错误：按系数收缩，至少减 1，不低于下限
    /// 2. 否则窗口满且全部成功、内存低于余量线：增加 `grow_step`，不超过上限，并清空窗口
    pub fn recompute(&mut self, signals: &ControlSignals) -> ConcurrencyChange {
        let from = self.allowed;

        if let Some(reason) = self.shrink_reason(signals) {
            return self.shrink(reason);
        }

        let comfortable = (signals.memory.used_bytes as f64)
            <= self.config.memory_high_watermark_bytes as f64 * self.config.grow_headroom_ratio;
        if self.window.is_full() && self.window.all_successes() && comfortable {
            let to = (from + self.config.grow_step).min(self.config.max_concurrency);
            if to == from {
                return ConcurrencyChange::Unchanged;
            }
            self.allowed = to;
            self.window.clear();
            return ConcurrencyChange::Grew { from, to };
        }

        ConcurrencyChange::Unchanged
    }

    /// 只看内存读数：达到水位线时收缩一步，不读写结果窗口
    ///
    /// 内存采样到达和派发前都会调用，不必等执行结束。
    pub fn on_memory(&mut self, memory: &MemoryPressure) -> ConcurrencyChange {
        if memory.used_bytes >= self.config.memory_high_watermark_bytes {
            self.shrink(ShrinkReason::MemoryPressure)
        } else {
            ConcurrencyChange::Unchanged
        }
    }

    fn shrink(&mut self, reason: ShrinkReason) -> ConcurrencyChange {
        let from = self.allowed;
        let to = shrink_target(from, self.config.min_concurrency, self.config.shrink_factor);
        if to == from {
            return ConcurrencyChange::Unchanged;
        }
        self.allowed = to;
        ConcurrencyChange::Shrunk { from, to, reason }
    }

    fn shrink_reason(&self, signals: &ControlSignals) -> Option<ShrinkReason> {
        if signals.memory.used_bytes >= self.config.memory_high_watermark_bytes {
            Some(ShrinkReason::MemoryPressure)
        } else if signals.resource_exhausted {
            Some(ShrinkReason::ResourceExhausted)
        } else if !self.window.is_empty()
            && self.window.failure_rate() >= self.config.failure_rate_threshold
        {
            Some(ShrinkReason::FailureRate)
        } else {
            None
        }
    }
}

/// `floor(allowed * factor)`，不低于 `min`，高于 `min` 时至少减 1
fn shrink_target(allowed: usize, min: usize, factor: f64) -> usize {
    if allowed <= min {
        return min;
    }
    let scaled = (allowed as f64 * factor).floor() as usize;
    scaled.max(min).min(allowed - 1)
}

/// 执行槽位
#[derive(Debug, Clone, Default)]
pub struct WorkerSlot {
    pub id: usize,
    pub current_job: Option<JobId>,
}

impl WorkerSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            current_job: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.current_job.is_none()
    }
}

/// 供外部展示的只读快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub allowed_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub occupied: usize,
    pub queued: usize,
    pub awaiting_retry: usize,
    pub running: Vec<JobId>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub failure_rate: f64,
    pub memory_used_bytes: u64,
    pub memory_level: f64,
    pub draining: bool,
}
