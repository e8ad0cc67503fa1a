//! Node 审计引擎 - 基础设施层
//!
//! 以子进程方式运行 `node <entry> audit --url <url> --browser-endpoint <ws> --engine-json`，
//! 从 stdout 逐行读取 JSON 事件：
//!
//! ```text
//! {"type":"progress", ...}                              忽略
//! {"type":"result","metrics":{"performance":0.93}}      审计结果
//! {"type":"error","kind":"network","message":"..."}     审计错误
//! ```
//!
//! 子进程设置了 `kill_on_drop`，丢弃审计 future 即可终止引擎。

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{AuditError, ConfigError};
use crate::infrastructure::audit_engine::AuditEngine;
use crate::infrastructure::engine_manifest::{parse_node_major, resolve_engine_from};
use crate::models::Metrics;

const STDERR_TAIL_LINES: usize = 6;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EngineLine {
    Result {
        metrics: BTreeMap<String, serde_json::Value>,
    },
    Error {
        kind: String,
        message: String,
        #[serde(default, rename = "timeoutMs")]
        timeout_ms: Option<u64>,
    },
    #[serde(other)]
    Other,
}

/// 引擎输出汇总
#[derive(Debug, Default)]
struct EngineOutput {
    metrics: Option<Metrics>,
    error: Option<AuditError>,
}

/// Node 审计引擎
#[derive(Debug, Clone)]
pub struct NodeAuditEngine {
    node_binary: String,
    entry_path: PathBuf,
    engine_version: String,
    min_node_major: Option<u32>,
}

impl NodeAuditEngine {
    pub fn new(node_binary: impl Into<String>, entry_path: impl Into<PathBuf>) -> Self {
        Self {
            node_binary: node_binary.into(),
            entry_path: entry_path.into(),
            engine_version: "unknown".to_string(),
            min_node_major: None,
        }
    }

    /// 从引擎清单创建，清单按配置路径、缓存目录、程序目录的顺序查找
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let resolved = resolve_engine_from(&config.manifest_path)?;
        info!(
            "✓ 审计引擎 v{} ({})",
            resolved.manifest.engine_version,
            resolved.entry_path.display()
        );
        Ok(Self {
            node_binary: config.node_binary.clone(),
            entry_path: resolved.entry_path,
            engine_version: resolved.manifest.engine_version.clone(),
            min_node_major: resolved.manifest.min_node_major(),
        })
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// 检查 Node 是否可用且满足清单要求的最低版本，返回版本号
    pub async fn verify_node(&self) -> Result<String, ConfigError> {
        let output = Command::new(&self.node_binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ConfigError::invalid("engine.node_binary", format!("无法运行 {}: {}", self.node_binary, e))
            })?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let Some(required) = self.min_node_major else {
            return Ok(version);
        };
        match parse_node_major(&version) {
            Some(major) if major >= required => Ok(version),
            Some(major) => Err(ConfigError::invalid(
                "engine.node_binary",
                format!("Node {version} (主版本 {major}) 低于要求的 {required}"),
            )),
            None => Err(ConfigError::invalid(
                "engine.node_binary",
                format!("无法识别的 Node 版本: {version}"),
            )),
        }
    }

    fn command(&self, url: &str, endpoint: &str) -> Command {
        let mut command = Command::new(&self.node_binary);
        command
            .arg(&self.entry_path)
            .args(["audit", "--url", url, "--browser-endpoint", endpoint, "--engine-json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl AuditEngine for NodeAuditEngine {
    async fn audit(&self, url: &str, endpoint: &str) -> Result<Metrics, AuditError> {
        let mut child = self
            .command(url, endpoint)
            .spawn()
            .map_err(|e| AuditError::Engine(format!("无法启动审计引擎: {e}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(AuditError::Engine("无法读取审计引擎输出".to_string()));
        };

        let (output, stderr_tail) = tokio::join!(read_engine_output(stdout), read_tail(stderr));
        let status = child
            .wait()
            .await
            .map_err(|e| AuditError::Engine(format!("等待审计引擎退出失败: {e}")))?;

        match output {
            EngineOutput {
                error: Some(error), ..
            } => Err(error),
            EngineOutput {
                metrics: Some(metrics),
                ..
            } => Ok(metrics),
            _ if status.success() => Err(AuditError::Engine("审计引擎未返回结果".to_string())),
            _ => Err(AuditError::Engine(format!(
                "审计引擎异常退出 ({status}): {stderr_tail}"
            ))),
        }
    }

    fn supports_early_termination(&self) -> bool {
        true
    }
}

async fn read_engine_output(stdout: impl AsyncRead + Unpin) -> EngineOutput {
    let mut output = EngineOutput::default();
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<EngineLine>(trimmed) {
            Ok(EngineLine::Result { metrics }) => {
                output.metrics = Some(numeric_metrics(metrics));
            }
            Ok(EngineLine::Error {
                kind,
                message,
                timeout_ms,
            }) => {
                if output.error.is_none() {
                    output.error = Some(map_engine_error(&kind, message, timeout_ms));
                }
            }
            Ok(EngineLine::Other) => debug!("引擎事件: {}", trimmed),
            Err(_) => debug!("引擎输出: {}", trimmed),
        }
    }
    output
}

async fn read_tail(stderr: impl AsyncRead + Unpin) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join(" | ")
}

/// 非数值的指标（如 null）直接丢弃
fn numeric_metrics(raw: BTreeMap<String, serde_json::Value>) -> Metrics {
    raw.into_iter()
        .filter_map(|(name, value)| value.as_f64().map(|score| (name, score)))
        .collect()
}

fn map_engine_error(kind: &str, message: String, timeout_ms: Option<u64>) -> AuditError {
    match kind {
        "network" => AuditError::Network(message),
        "timeout" => AuditError::Timeout {
            timeout_ms: timeout_ms.unwrap_or(0),
        },
        "resource" | "resource_exhausted" | "out_of_memory" => {
            AuditError::ResourceExhausted(message)
        }
        "invalid_url" => AuditError::InvalidUrl(message),
        "invalid_config" => AuditError::InvalidConfig(message),
        other => AuditError::Engine(format!("{other}: {message}")),
    }
}
