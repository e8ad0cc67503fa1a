//! 运行配置
//!
//! 所有策略参数都通过 [`Config`] 显式传入 `RunCoordinator`，不存在进程级全局配置。
//! 加载顺序：默认值 → TOML 文件（`AUDIT_CONFIG` 或 `audit.toml`）→ 环境变量。

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::services::retry_controller::{DefaultClassifier, ErrorClassifier};

const GIB: u64 = 1024 * 1024 * 1024;

/// 程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 工作池策略
    pub pool: PoolConfig,
    /// 重试策略
    pub retry: RetryPolicy,
    /// 内存监控
    pub memory: MemoryConfig,
    /// 浏览器启动参数
    pub browser: BrowserSettings,
    /// 审计引擎
    pub engine: EngineConfig,
    /// 取消后在途任务的宽限期（毫秒）
    pub grace_period_ms: u64,
    /// 任务计划文件
    pub plan_file: PathBuf,
    /// 运行结果输出根目录
    pub output_root: PathBuf,
    /// 状态目录（进程台账、运行历史）
    pub state_dir: Option<PathBuf>,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            memory: MemoryConfig::default(),
            browser: BrowserSettings::default(),
            engine: EngineConfig::default(),
            grace_period_ms: 10_000,
            plan_file: PathBuf::from("audit-plan.toml"),
            output_root: PathBuf::from("audit-runs"),
            state_dir: Some(PathBuf::from(".audit-pool")),
            verbose_logging: false,
            output_log_file: "audit-run.log".to_string(),
        }
    }
}

/// 工作池配置
///
/// 收缩快、增长慢：超过水位线或失败率阈值时立即按 `shrink_factor` 收缩，
/// 只有整个窗口全部成功且内存充裕时才增加 `grow_step`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub min_concurrency: usize,
    /// 初始并发数，缺省为 `max_concurrency`
    pub initial_concurrency: Option<usize>,
    pub memory_high_watermark_bytes: u64,
    /// 窗口内失败率阈值 (0, 1]
    pub failure_rate_threshold: f64,
    /// 最近结果窗口大小
    pub window_size: usize,
    /// 收缩系数 (0, 1)
    pub shrink_factor: f64,
    /// 每次增长的槽位数
    pub grow_step: usize,
    /// 内存低于 `水位线 * grow_headroom_ratio` 时才允许增长
    pub grow_headroom_ratio: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            min_concurrency: 1,
            initial_concurrency: None,
            memory_high_watermark_bytes: 8 * GIB,
            failure_rate_threshold: 0.5,
            window_size: 10,
            shrink_factor: 0.5,
            grow_step: 1,
            grow_headroom_ratio: 0.85,
        }
    }
}

impl PoolConfig {
    /// 实际使用的初始并发数
    pub fn starting_concurrency(&self) -> usize {
        self.initial_concurrency
            .unwrap_or(self.max_concurrency)
            .clamp(self.min_concurrency, self.max_concurrency)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_concurrency < 1 {
            return Err(ConfigError::invalid("pool.min_concurrency", "必须 >= 1"));
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(ConfigError::invalid(
                "pool.max_concurrency",
                format!(
                    "{} 小于 min_concurrency {}",
                    self.max_concurrency, self.min_concurrency
                ),
            ));
        }
        if let Some(initial) = self.initial_concurrency {
            if initial < self.min_concurrency || initial > self.max_concurrency {
                return Err(ConfigError::invalid(
                    "pool.initial_concurrency",
                    format!(
                        "{} 不在 [{}, {}] 范围内",
                        initial, self.min_concurrency, self.max_concurrency
                    ),
                ));
            }
        }
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "pool.failure_rate_threshold",
                format!("{} 不在 (0, 1] 范围内", self.failure_rate_threshold),
            ));
        }
        if self.window_size < 1 {
            return Err(ConfigError::invalid("pool.window_size", "必须 >= 1"));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(ConfigError::invalid(
                "pool.shrink_factor",
                format!("{} 不在 (0, 1) 范围内", self.shrink_factor),
            ));
        }
        if self.grow_step < 1 {
            return Err(ConfigError::invalid("pool.grow_step", "必须 >= 1"));
        }
        if !(self.grow_headroom_ratio > 0.0 && self.grow_headroom_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "pool.grow_headroom_ratio",
                format!("{} 不在 (0, 1] 范围内", self.grow_headroom_ratio),
            ));
        }
        if self.memory_high_watermark_bytes == 0 {
            return Err(ConfigError::invalid(
                "pool.memory_high_watermark_bytes",
                "必须 > 0",
            ));
        }
        Ok(())
    }
}

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter_ms: u64,
    /// 错误分类器
    #[serde(skip, default = "default_classifier")]
    pub classifier: Arc<dyn ErrorClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_jitter_ms: 250,
            classifier: default_classifier(),
        }
    }
}

fn default_classifier() -> Arc<dyn ErrorClassifier> {
    Arc::new(DefaultClassifier)
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::invalid("retry.max_attempts", "必须 >= 1"));
        }
        Ok(())
    }
}

/// 内存监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// 采样间隔（毫秒）
    pub sample_interval_ms: u64,
    /// 用于平滑的历史样本数
    pub history_len: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            history_len: 5,
        }
    }
}

/// 浏览器启动参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// 浏览器可执行文件，缺省时自动查找
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub extra_args: Vec<String>,
    /// 等待调试地址的超时（毫秒）
    pub startup_timeout_ms: u64,
    /// 每次执行的临时用户目录根路径，缺省为系统临时目录
    pub profile_root: Option<PathBuf>,
    /// 同时存活的浏览器上限，缺省为 `pool.max_concurrency`
    pub max_live_browsers: Option<usize>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            extra_args: Vec::new(),
            startup_timeout_ms: 15_000,
            profile_root: None,
            max_live_browsers: None,
        }
    }
}

/// 审计引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 引擎清单 `engine.manifest.json`
    pub manifest_path: PathBuf,
    pub node_binary: String,
    /// 单次审计超时（毫秒）
    pub attempt_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("engine/engine.manifest.json"),
            node_binary: "node".to_string(),
            attempt_timeout_ms: 120_000,
        }
    }
}

impl Config {
    /// 按 默认值 → 配置文件 → 环境变量 的顺序加载
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("AUDIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("audit.toml"));

        let mut config = if path.exists() {
            Self::from_toml_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载，缺失字段使用默认值
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
            path: path.display().to_string(),
            source,
        })
    }

    /// 仅使用默认值和环境变量
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// 用环境变量覆盖当前配置
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("AUDIT_MAX_CONCURRENCY")? {
            self.pool.max_concurrency = v;
        }
        if let Some(v) = env_parse("AUDIT_MIN_CONCURRENCY")? {
            self.pool.min_concurrency = v;
        }
        if let Some(v) = env_parse("AUDIT_MEMORY_WATERMARK_BYTES")? {
            self.pool.memory_high_watermark_bytes = v;
        }
        if let Some(v) = env_parse("AUDIT_FAILURE_RATE_THRESHOLD")? {
            self.pool.failure_rate_threshold = v;
        }
        if let Some(v) = env_parse("AUDIT_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("AUDIT_BACKOFF_BASE_MS")? {
            self.retry.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("AUDIT_GRACE_PERIOD_MS")? {
            self.grace_period_ms = v;
        }
        if let Ok(v) = std::env::var("AUDIT_PLAN_FILE") {
            self.plan_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AUDIT_OUTPUT_ROOT") {
            self.output_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("AUDIT_CHROME_PATH") {
            self.browser.executable = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("AUDIT_ENGINE_MANIFEST") {
            self.engine.manifest_path = PathBuf::from(v);
        }
        if let Some(v) = env_parse("VERBOSE_LOGGING")? {
            self.verbose_logging = v;
        }
        if let Ok(v) = std::env::var("OUTPUT_LOG_FILE") {
            self.output_log_file = v;
        }
        Ok(())
    }

    /// 检查配置；非法配置会让运行在调度开始前中止
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.retry.validate()?;
        if self.memory.sample_interval_ms == 0 {
            return Err(ConfigError::invalid("memory.sample_interval_ms", "必须 > 0"));
        }
        if self.memory.history_len == 0 {
            return Err(ConfigError::invalid("memory.history_len", "必须 >= 1"));
        }
        if self.engine.attempt_timeout_ms == 0 {
            return Err(ConfigError::invalid("engine.attempt_timeout_ms", "必须 > 0"));
        }
        if self.browser.max_live_browsers == Some(0) {
            return Err(ConfigError::invalid("browser.max_live_browsers", "必须 >= 1"));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(var_name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: std::any::type_name::<T>().to_string(),
            }),
        Err(_) => Ok(None),
    }
}
