//! 进度报告 - 业务能力层
//!
//! 控制循环和执行槽位通过 [`ProgressSender`] 非阻塞地发送事件，
//! 单独的报告任务负责写日志、转发给订阅者、追加运行日志文件，并在结束时汇总。
//! 同一任务的事件保持发送顺序，不同任务之间按到达顺序交错。

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ErrorKind;
use crate::models::JobId;
use crate::services::retry_controller::{Classification, FinalizeReason};

/// 生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Queued {
        job_id: JobId,
        url: String,
    },
    Started {
        job_id: JobId,
        attempt: u32,
        slot_id: usize,
    },
    Retried {
        job_id: JobId,
        attempt: u32,
        delay_ms: u64,
        classification: Classification,
        error: String,
    },
    Succeeded {
        job_id: JobId,
        attempts: u32,
        duration_ms: u64,
    },
    FailedPermanent {
        job_id: JobId,
        attempts: u32,
        error_kind: ErrorKind,
        reason: FinalizeReason,
        message: String,
    },
    Cancelled {
        job_id: JobId,
        attempts: u32,
    },
    ConcurrencyChanged {
        from: usize,
        to: usize,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            ProgressEvent::Queued { job_id, .. }
            | ProgressEvent::Started { job_id, .. }
            | ProgressEvent::Retried { job_id, .. }
            | ProgressEvent::Succeeded { job_id, .. }
            | ProgressEvent::FailedPermanent { job_id, .. }
            | ProgressEvent::Cancelled { job_id, .. } => Some(job_id),
            ProgressEvent::ConcurrencyChanged { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Succeeded { .. }
                | ProgressEvent::FailedPermanent { .. }
                | ProgressEvent::Cancelled { .. }
        )
    }
}

/// 运行汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub queued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub retries: usize,
    pub concurrency_changes: usize,
    pub total_duration_ms: u64,
}

impl RunSummary {
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }

    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Queued { .. } => self.queued += 1,
            ProgressEvent::Started { .. } => {}
            ProgressEvent::Retried { .. } => self.retries += 1,
            ProgressEvent::Succeeded { .. } => self.succeeded += 1,
            ProgressEvent::FailedPermanent { .. } => self.failed += 1,
            ProgressEvent::Cancelled { .. } => self.cancelled += 1,
            ProgressEvent::ConcurrencyChanged { .. } => self.concurrency_changes += 1,
        }
    }
}

/// 事件发送端，可随意克隆
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    /// 非阻塞发送；报告任务已结束时丢弃事件
    pub fn notify(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            debug!("进度报告已关闭，丢弃事件");
        }
    }
}

/// 进度报告器
pub struct ProgressReporter {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    subscribers: broadcast::Sender<ProgressEvent>,
    log_file: Option<PathBuf>,
}

/// 创建发送端和报告器
pub fn channel(subscribers: broadcast::Sender<ProgressEvent>) -> (ProgressSender, ProgressReporter) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender { tx },
        ProgressReporter {
            rx,
            subscribers,
            log_file: None,
        },
    )
}

impl ProgressReporter {
    /// 终态事件追加写入日志文件
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// 在后台消费事件，所有发送端关闭后返回汇总
    pub fn spawn(self) -> JoinHandle<RunSummary> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> RunSummary {
        let started_at = Instant::now();
        let mut summary = RunSummary::default();

        while let Some(event) = self.rx.recv().await {
            summary.apply(&event);
            log_event(&event, &summary);
            if event.is_terminal() {
                self.append_to_log_file(&event);
            }
            // 没有订阅者时发送失败，忽略
            let _ = self.subscribers.send(event);
        }

        summary.total_duration_ms = started_at.elapsed().as_millis() as u64;
        summary
    }

    fn append_to_log_file(&self, event: &ProgressEvent) {
        let Some(path) = &self.log_file else {
            return;
        };
        let line = format!(
            "{} | {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            describe_terminal(event)
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            warn!("⚠️ 写入运行日志失败 ({}): {}", path.display(), e);
        }
    }
}

fn describe_terminal(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Succeeded {
            job_id,
            attempts,
            duration_ms,
        } => format!("任务 {job_id} | 成功 | 执行 {attempts} 次 | 耗时 {duration_ms}ms"),
        ProgressEvent::FailedPermanent {
            job_id,
            attempts,
            error_kind,
            message,
            ..
        } => format!("任务 {job_id} | 失败 ({error_kind}) | 执行 {attempts} 次 | {message}"),
        ProgressEvent::Cancelled { job_id, attempts } => {
            format!("任务 {job_id} | 已取消 | 执行 {attempts} 次")
        }
        other => format!("{other:?}"),
    }
}

fn log_event(event: &ProgressEvent, summary: &RunSummary) {
    let progress = format!("{}/{}", summary.finished(), summary.queued);
    match event {
        ProgressEvent::Queued { job_id, url } => {
            debug!("[任务 {}] 📋 已排队: {}", job_id, url);
        }
        ProgressEvent::Started {
            job_id,
            attempt,
            slot_id,
        } => {
            info!(
                "[任务 {}] 🚀 第 {} 次执行 (槽位 #{})",
                job_id, attempt, slot_id
            );
        }
        ProgressEvent::Retried {
            job_id,
            attempt,
            delay_ms,
            error,
            ..
        } => {
            warn!(
                "[任务 {}] ↻ 第 {} 次执行失败，{}ms 后重试: {}",
                job_id, attempt, delay_ms, error
            );
        }
        ProgressEvent::Succeeded {
            job_id,
            attempts,
            duration_ms,
        } => {
            info!(
                "[任务 {}] ✅ 审计完成 (执行 {} 次, 耗时 {}ms) [{}]",
                job_id, attempts, duration_ms, progress
            );
        }
        ProgressEvent::FailedPermanent {
            job_id,
            attempts,
            error_kind,
            message,
            ..
        } => {
            error!(
                "[任务 {}] ❌ 最终失败 ({}, 执行 {} 次): {} [{}]",
                job_id, error_kind, attempts, message, progress
            );
        }
        ProgressEvent::Cancelled { job_id, attempts } => {
            warn!(
                "[任务 {}] ⏹ 已取消 (执行 {} 次) [{}]",
                job_id, attempts, progress
            );
        }
        ProgressEvent::ConcurrencyChanged { from, to, reason } => {
            let marker = if to < from { "📉" } else { "📈" };
            info!("{} 并发调整 {} → {} ({})", marker, from, to, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> JobId {
        JobId::new(id)
    }

    #[tokio::test]
    async fn summary_counts_events() {
        let (subscribers, mut sub_rx) = broadcast::channel(16);
        let (sender, reporter) = channel(subscribers);
        let task = reporter.spawn();

        sender.notify(ProgressEvent::Queued {
            job_id: job("a"),
            url: "https://a.example".into(),
        });
        sender.notify(ProgressEvent::Queued {
            job_id: job("b"),
            url: "https://b.example".into(),
        });
        sender.notify(ProgressEvent::Retried {
            job_id: job("a"),
            attempt: 1,
            delay_ms: 100,
            classification: Classification::Transient,
            error: "reset".into(),
        });
        sender.notify(ProgressEvent::Succeeded {
            job_id: job("a"),
            attempts: 2,
            duration_ms: 10,
        });
        sender.notify(ProgressEvent::Cancelled {
            job_id: job("b"),
            attempts: 0,
        });
        drop(sender);

        let summary = task.await.unwrap();
        assert_eq!(summary.queued, 2);
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.finished(), 2);

        let first = sub_rx.recv().await.unwrap();
        assert_eq!(first.job_id(), Some(&job("a")));
    }

    #[tokio::test]
    async fn terminal_events_are_appended_to_log_file() {
        let path = std::env::temp_dir().join(format!(
            "audit-pool-progress-{}.log",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        let (subscribers, _) = broadcast::channel(4);
        let (sender, reporter) = channel(subscribers);
        let task = reporter.with_log_file(&path).spawn();

        sender.notify(ProgressEvent::Started {
            job_id: job("a"),
            attempt: 1,
            slot_id: 0,
        });
        sender.notify(ProgressEvent::FailedPermanent {
            job_id: job("a"),
            attempts: 1,
            error_kind: ErrorKind::Fatal,
            reason: FinalizeReason::Fatal,
            message: "非法 URL".into(),
        });
        drop(sender);
        task.await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("任务 a | 失败 (fatal)"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = ProgressEvent::ConcurrencyChanged {
            from: 4,
            to: 2,
            reason: "memory_pressure".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "concurrency_changed");
        assert!(event.job_id().is_none());
        assert!(!event.is_terminal());
    }
}
