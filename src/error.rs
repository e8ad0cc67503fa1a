use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误分类
///
/// 重试控制器和工作池只依据这个分类做决策，不关心具体错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 瞬时错误（网络、超时、端口占用、临时启动失败），按策略重试
    Transient,
    /// 致命错误（非法 URL、非法任务配置），立即终结，不重试
    Fatal,
    /// 资源错误（内存耗尽、启动容量耗尽），触发并发收缩并重新排队
    Resource,
    /// 进程监管错误（无法终止浏览器进程），只记录日志
    Supervisor,
    /// 取消
    Cancellation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Resource => "resource",
            ErrorKind::Supervisor => "supervisor",
            ErrorKind::Cancellation => "cancellation",
        };
        f.write_str(name)
    }
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("任务计划错误: {0}")]
    Plan(#[from] PlanError),

    #[error("浏览器启动错误: {0}")]
    Launch(#[from] LaunchError),

    #[error("审计引擎错误: {0}")]
    Audit(#[from] AuditError),

    #[error("进程监管错误: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("运行错误: {0}")]
    Run(#[from] RunError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON解析失败: {0}")]
    Json(#[from] serde_json::Error),
}

/// 浏览器启动错误
#[derive(Debug, Error)]
pub enum LaunchError {
    /// 启动浏览器进程失败
    #[error("无法启动浏览器 {executable}: {source}")]
    SpawnFailed {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    /// 调试端口被占用
    #[error("调试端口已被占用: {detail}")]
    PortInUse { detail: String },

    /// 等待调试地址超时
    #[error("等待浏览器调试地址超时 ({timeout_ms}ms)")]
    StartupTimeout { timeout_ms: u64 },

    /// 浏览器进程退出前没有输出调试地址
    #[error("浏览器进程提前退出，未输出调试地址: {stderr_tail}")]
    EndpointNotReported { stderr_tail: String },

    /// 调试地址不可用
    #[error("调试地址 {endpoint} 探测失败: {message}")]
    ProbeFailed { endpoint: String, message: String },

    /// 同时存活的浏览器数量已达上限
    #[error("浏览器容量已耗尽 (存活 {live} / 上限 {limit})")]
    CapacityExhausted { live: usize, limit: usize },

    /// 同一个任务已经持有一个浏览器句柄
    #[error("任务 {job_id} 已持有浏览器句柄")]
    HandleAlreadyHeld { job_id: String },
}

impl LaunchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchError::CapacityExhausted { .. } => ErrorKind::Resource,
            LaunchError::HandleAlreadyHeld { .. } => ErrorKind::Fatal,
            _ => ErrorKind::Transient,
        }
    }
}

/// 审计引擎错误
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("审计超时 ({timeout_ms}ms)")]
    Timeout { timeout_ms: u64 },

    #[error("资源耗尽: {0}")]
    ResourceExhausted(String),

    #[error("非法 URL: {0}")]
    InvalidUrl(String),

    #[error("非法任务配置: {0}")]
    InvalidConfig(String),

    /// 引擎内部错误（未分类的失败按瞬时错误处理）
    #[error("引擎错误: {0}")]
    Engine(String),

    /// 审计在宽限期结束时被中断
    #[error("审计被中断")]
    Interrupted,
}

impl AuditError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuditError::Network(_) | AuditError::Timeout { .. } | AuditError::Engine(_) => {
                ErrorKind::Transient
            }
            AuditError::ResourceExhausted(_) => ErrorKind::Resource,
            AuditError::InvalidUrl(_) | AuditError::InvalidConfig(_) => ErrorKind::Fatal,
            AuditError::Interrupted => ErrorKind::Cancellation,
        }
    }
}

/// 单次执行失败（启动失败或审计失败）
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl AttemptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::Launch(e) => e.kind(),
            AttemptError::Audit(e) => e.kind(),
        }
    }
}

/// 进程监管错误
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("无法终止浏览器进程 {pid}: {message}")]
    KillFailed { pid: u32, message: String },

    #[error("进程台账读写失败 ({path}): {source}")]
    LedgerIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("进程台账格式错误 ({path}): {source}")]
    LedgerFormat {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Supervisor
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置项 {field} 非法: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },

    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("解析配置文件失败 ({path}): {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("未找到可用的浏览器 (已搜索: {})", searched.join(", "))]
    BrowserNotFound { searched: Vec<String> },

    #[error("引擎清单非法 ({path}): {reason}")]
    ManifestInvalid { path: String, reason: String },

    #[error("未找到引擎清单 (已搜索: {})", searched.join(", "))]
    ManifestNotFound { searched: Vec<String> },
}

/// 任务计划错误
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("任务 ID 重复: {job_id}")]
    DuplicateJobId { job_id: String },

    #[error("第 {index} 个任务非法: {reason}")]
    InvalidEntry { index: usize, reason: String },
}

/// 运行状态错误
#[derive(Debug, Error)]
pub enum RunError {
    #[error("运行已开始，当前状态: {state}")]
    AlreadyStarted { state: String },

    #[error("工作池控制任务异常退出: {0}")]
    PoolTaskFailed(String),
}

// ========== 便捷构造函数 ==========

impl ConfigError {
    /// 创建配置项非法错误
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl SupervisorError {
    /// 创建进程终止失败错误
    pub fn kill_failed(pid: u32, message: impl std::fmt::Display) -> Self {
        SupervisorError::KillFailed {
            pid,
            message: message.to_string(),
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_failures_are_transient_except_capacity_and_duplicates() {
        assert_eq!(
            LaunchError::StartupTimeout { timeout_ms: 100 }.kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            LaunchError::PortInUse {
                detail: "bind() failed".into()
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            LaunchError::CapacityExhausted { live: 4, limit: 4 }.kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            LaunchError::HandleAlreadyHeld {
                job_id: "job-1".into()
            }
            .kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn audit_error_kinds() {
        assert_eq!(AuditError::Network("reset".into()).kind(), ErrorKind::Transient);
        assert_eq!(AuditError::Timeout { timeout_ms: 5 }.kind(), ErrorKind::Transient);
        assert_eq!(
            AuditError::ResourceExhausted("oom".into()).kind(),
            ErrorKind::Resource
        );
        assert_eq!(AuditError::InvalidUrl("x".into()).kind(), ErrorKind::Fatal);
        assert_eq!(AuditError::InvalidConfig("x".into()).kind(), ErrorKind::Fatal);
        assert_eq!(AuditError::Interrupted.kind(), ErrorKind::Cancellation);
    }

    #[test]
    fn attempt_error_delegates_kind() {
        let err: AttemptError = AuditError::InvalidUrl("ftp://x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        let err: AttemptError = LaunchError::StartupTimeout { timeout_ms: 1 }.into();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn browser_not_found_lists_candidates() {
        let err = ConfigError::BrowserNotFound {
            searched: vec!["/a/chrome".into(), "/b/edge".into()],
        };
        assert!(err.to_string().contains("/a/chrome, /b/edge"));
    }
}
