//! 运行历史 - 业务能力层
//!
//! `history.json` 保存最近的运行记录，新记录在前，最多保留 100 条

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::orchestrator::run_coordinator::RunState;

pub const HISTORY_FILE_NAME: &str = "history.json";
const MAX_HISTORY_ENTRIES: usize = 100;

/// 一次运行的摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    /// RFC 3339
    pub created_at: String,
    pub job_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub final_state: RunState,
    pub output_dir: String,
}

pub struct RunHistory {
    path: PathBuf,
}

impl RunHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(HISTORY_FILE_NAME))
    }

    /// 读取历史，文件不存在或内容损坏时返回空列表
    pub async fn load(&self) -> Vec<HistoryEntry> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                debug!("历史文件无法解析，忽略 ({}): {}", self.path.display(), e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    /// 在最前面插入一条记录并写回
    pub async fn record(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.load().await;
        entries.retain(|e| e.id != entry.id);
        entries.insert(0, entry);
        entries.truncate(MAX_HISTORY_ENTRIES);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("无法创建目录: {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(&entries)? + "\n";
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("无法写入运行历史: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: usize) -> HistoryEntry {
        HistoryEntry {
            id: format!("run-{id}"),
            created_at: "2026-01-01T00:00:00Z".into(),
            job_count: 3,
            succeeded: 2,
            failed: 1,
            cancelled: 0,
            final_state: RunState::Completed,
            output_dir: format!("audit-runs/run-{id}"),
        }
    }

    #[tokio::test]
    async fn newest_first_and_capped() {
        let dir = std::env::temp_dir().join(format!("audit-pool-history-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let history = RunHistory::in_dir(&dir);

        for i in 0..(MAX_HISTORY_ENTRIES + 5) {
            history.record(entry(i)).await.unwrap();
        }
        let entries = history.load().await;
        assert_eq!(entries.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(entries[0].id, format!("run-{}", MAX_HISTORY_ENTRIES + 4));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn corrupt_history_is_treated_as_empty() {
        let path = std::env::temp_dir().join(format!(
            "audit-pool-history-corrupt-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "[{").unwrap();
        let history = RunHistory::new(&path);
        assert!(history.load().await.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
