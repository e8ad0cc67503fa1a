//! 内存监控 - 业务能力层
//!
//! 定时采样系统内存，用最近几次样本的均值作为平滑后的压力值，
//! 通过 `watch` 通道发布给工作池。监控只提供信号，从不终止任务或进程。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 判断趋势时的相对变化阈值
const TREND_THRESHOLD: f64 = 0.02;

/// 单次内存读数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// 内存读数来源
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Result<MemoryReading>;
}

/// 基于 sysinfo 的系统内存读数
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn read(&self) -> Result<MemoryReading> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| anyhow!("内存探针锁已中毒"))?;
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            return Err(anyhow!("无法读取系统内存总量"));
        }
        let available = system.available_memory();
        Ok(MemoryReading {
            used_bytes: total.saturating_sub(available),
            free_bytes: available,
        })
    }
}

/// 内存变化趋势
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTrend {
    Rising,
    Falling,
    #[default]
    Stable,
}

/// 带时间戳的样本
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub taken_at: tokio::time::Instant,
}

/// 平滑后的内存压力
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MemoryPressure {
    /// 历史样本均值
    pub used_bytes: u64,
    pub free_bytes: u64,
    /// `used_bytes / watermark`，1.0 表示刚好到达水位线
    pub level: f64,
    pub trend: MemoryTrend,
    pub samples: usize,
}

/// 内存监控
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    watermark_bytes: u64,
    history_len: usize,
    history: VecDeque<MemorySample>,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, watermark_bytes: u64, history_len: usize) -> Self {
        let history_len = history_len.max(1);
        Self {
            probe,
            watermark_bytes: watermark_bytes.max(1),
            history_len,
            history: VecDeque::with_capacity(history_len),
        }
    }

    /// 采样一次并记入历史
    pub async fn sample(&mut self) -> Result<MemorySample> {
        let probe = self.probe.clone();
        let reading = tokio::task::spawn_blocking(move || probe.read()).await??;

        let sample = MemorySample {
            used_bytes: reading.used_bytes,
            free_bytes: reading.free_bytes,
            taken_at: tokio::time::Instant::now(),
        };
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        Ok(sample)
    }

    /// 当前平滑压力
    pub fn current_pressure(&self) -> MemoryPressure {
        let count = self.history.len();
        if count == 0 {
            return MemoryPressure::default();
        }

        let used_sum: u128 = self.history.iter().map(|s| u128::from(s.used_bytes)).sum();
        let used_bytes = (used_sum / count as u128) as u64;
        let free_bytes = self.history.back().map(|s| s.free_bytes).unwrap_or(0);

        MemoryPressure {
            used_bytes,
            free_bytes,
            level: used_bytes as f64 / self.watermark_bytes as f64,
            trend: self.trend(),
            samples: count,
        }
    }

    /// 比较前半段与后半段均值
    fn trend(&self) -> MemoryTrend {
        let count = self.history.len();
        if count < 2 {
            return MemoryTrend::Stable;
        }
        let half = count / 2;
        let older = mean_used(self.history.iter().take(half), half);
        let newer = mean_used(self.history.iter().skip(count - half), half);

        if older <= 0.0 {
            return MemoryTrend::Stable;
        }
        let change = (newer - older) / older;
        if change > TREND_THRESHOLD {
            MemoryTrend::Rising
        } else if change < -TREND_THRESHOLD {
            MemoryTrend::Falling
        } else {
            MemoryTrend::Stable
        }
    }

    /// 先采样一次，再在后台按固定间隔采样，直到 `stop` 被取消
    pub async fn start(mut self, interval: Duration, stop: CancellationToken) -> MonitorHandle {
        if let Err(e) = self.sample().await {
            warn!("⚠️ 首次内存采样失败: {}", e);
        }
        let (tx, rx) = watch::channel(self.current_pressure());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即完成
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.sample().await {
                    Ok(sample) => {
                        let pressure = self.current_pressure();
                        debug!(
                            "内存采样: 当前 {} MiB, 平滑 {} MiB, 水位 {:.0}%, 趋势 {:?}",
                            sample.used_bytes / (1024 * 1024),
                            pressure.used_bytes / (1024 * 1024),
                            pressure.level * 100.0,
                            pressure.trend
                        );
                        tx.send_replace(pressure);
                    }
                    // 读数失败时保留上一次的压力值
                    Err(e) => warn!("⚠️ 内存采样失败: {}", e),
                }
            }
            debug!("内存监控已停止");
        });

        MonitorHandle { pressure: rx, task }
    }
}

fn mean_used<'a>(samples: impl Iterator<Item = &'a MemorySample>, n: usize) -> f64 {
    samples.map(|s| s.used_bytes as f64).sum::<f64>() / n as f64
}

/// 后台监控句柄
pub struct MonitorHandle {
    pub pressure: watch::Receiver<MemoryPressure>,
    pub task: JoinHandle<()>,
}
