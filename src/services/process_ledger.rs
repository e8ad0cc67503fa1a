//! 浏览器进程台账
//!
//! 把本工具启动的每个浏览器 pid 记录到 `<state_dir>/browser-processes.json`，
//! 进程被终止后移除。上一次运行崩溃留下的条目在下次启动时由 `sweep_orphans` 清理。

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;
use crate::models::JobId;

pub const LEDGER_FILE_NAME: &str = "browser-processes.json";

/// 台账条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub pid: u32,
    pub job_id: JobId,
    pub attempt: u32,
    pub run_id: String,
    pub launched_at: DateTime<Utc>,
}

/// 基于 JSON 文件的进程台账
#[derive(Debug, Clone)]
pub struct ProcessLedger {
    path: PathBuf,
}

impl ProcessLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 在状态目录下使用默认文件名
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(LEDGER_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部条目，文件不存在时返回空
    pub fn load(&self) -> Result<Vec<LedgerEntry>, SupervisorError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|source| SupervisorError::LedgerFormat {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn record(&self, entry: LedgerEntry) -> Result<(), SupervisorError> {
        let mut entries = self.load()?;
        entries.retain(|e| e.pid != entry.pid);
        entries.push(entry);
        self.save(&entries)
    }

    pub fn remove(&self, pid: u32) -> Result<(), SupervisorError> {
        let mut entries = self.load()?;
        let before = entries.len();
        entries.retain(|e| e.pid != pid);
        if entries.len() == before {
            return Ok(());
        }
        self.save(&entries)
    }

    /// 先写临时文件再重命名，避免崩溃时留下半个文件
    fn save(&self, entries: &[LedgerEntry]) -> Result<(), SupervisorError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        let json = serde_json::to_string_pretty(entries).map_err(|source| {
            SupervisorError::LedgerFormat {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json + "\n").map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> SupervisorError {
        SupervisorError::LedgerIo {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_ledger(name: &str) -> ProcessLedger {
        let dir = std::env::temp_dir().join(format!(
            "audit-pool-ledger-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        ProcessLedger::in_dir(&dir)
    }

    fn entry(pid: u32) -> LedgerEntry {
        LedgerEntry {
            pid,
            job_id: JobId::new(format!("job-{pid}")),
            attempt: 1,
            run_id: "run-1".into(),
            launched_at: Utc::now(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let ledger = temp_ledger("missing");
        assert!(ledger.load().unwrap().is_empty());
    }

    #[test]
    fn record_and_remove() {
        let ledger = temp_ledger("record");
        ledger.record(entry(10)).unwrap();
        ledger.record(entry(11)).unwrap();
        ledger.record(entry(10)).unwrap();
        assert_eq!(ledger.load().unwrap().len(), 2);

        ledger.remove(10).unwrap();
        let remaining = ledger.load().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pid, 11);

        ledger.remove(999).unwrap();
        assert_eq!(ledger.load().unwrap().len(), 1);

        if let Some(dir) = ledger.path().parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn corrupt_file_is_a_format_error() {
        let ledger = temp_ledger("corrupt");
        if let Some(dir) = ledger.path().parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(ledger.path(), "{not json").unwrap();
        assert!(matches!(
            ledger.load(),
            Err(SupervisorError::LedgerFormat { .. })
        ));
        if let Some(dir) = ledger.path().parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }
}
