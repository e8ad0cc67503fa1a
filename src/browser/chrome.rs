//! 本机 Chromium 系浏览器启动器
//!
//! 每次执行启动一个独立的无头浏览器进程：
//! - `--remote-debugging-port=0` 由浏览器自己选端口，从 stderr 读取调试地址
//! - 每次执行使用独立的 `--user-data-dir`，目录名带有 [`PROFILE_MARKER`]
//! - 交付前用 chromiumoxide 探测调试地址
//!
//! 终止孤儿进程前会检查其命令行是否带有标记，避免误杀复用了 pid 的其他进程。

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::browser::connection::probe_endpoint;
use crate::browser::launcher::{BrowserLauncher, LaunchOptions, LaunchedBrowser};
use crate::config::BrowserSettings;
use crate::error::{ConfigError, LaunchError, SupervisorError};

/// 用户目录名前缀，用于识别本工具启动的浏览器
pub const PROFILE_MARKER: &str = "audit-pool-profile";

const STDERR_TAIL_LINES: usize = 8;
const USER_DATA_DIR_FLAG: &str = "--user-data-dir=";

struct OwnedBrowser {
    child: Child,
    profile_dir: PathBuf,
}

/// Chrome / Edge / Brave / Chromium 启动器
pub struct ChromeLauncher {
    executable: PathBuf,
    settings: BrowserSettings,
    profile_root: PathBuf,
    children: Mutex<HashMap<u32, OwnedBrowser>>,
    endpoint_pattern: Regex,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChromeLauncher {
    pub fn new(settings: &BrowserSettings) -> Result<Self, ConfigError> {
        let executable = resolve_executable(settings.executable.as_deref())?;
        info!("✓ 使用浏览器: {}", executable.display());

        let endpoint_pattern = Regex::new(r"DevTools listening on (ws://\S+)")
            .map_err(|e| ConfigError::invalid("browser", e.to_string()))?;

        Ok(Self {
            executable,
            settings: settings.clone(),
            profile_root: settings
                .profile_root
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            children: Mutex::new(HashMap::new()),
            endpoint_pattern,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn profile_dir(&self, options: &LaunchOptions) -> PathBuf {
        let job: String = options
            .job_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.profile_root.join(format!(
            "{}-{}-{}-{}",
            PROFILE_MARKER, options.run_id, job, options.attempt
        ))
    }

    fn build_command(&self, profile_dir: &Path) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("--remote-debugging-port=0")
            .arg(format!("{}{}", USER_DATA_DIR_FLAG, profile_dir.display()))
            .args([
                "--no-first-run",
                "--no-default-browser-check",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-extensions",
            ]);
        if self.settings.headless {
            command.arg("--headless=new");
        }
        command
            .args(&self.settings.extra_args)
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_failed(&self, source: std::io::Error) -> LaunchError {
        LaunchError::SpawnFailed {
            executable: self.executable.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<LaunchedBrowser, LaunchError> {
        let profile_dir = self.profile_dir(options);
        tokio::fs::create_dir_all(&profile_dir)
            .await
            .map_err(|e| self.spawn_failed(e))?;

        let mut child = match self.build_command(&profile_dir).spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_profile_dir(&profile_dir).await;
                return Err(self.spawn_failed(e));
            }
        };

        let (Some(pid), Some(stderr)) = (child.id(), child.stderr.take()) else {
            discard(child, &profile_dir).await;
            return Err(LaunchError::EndpointNotReported {
                stderr_tail: "进程启动后立即退出".to_string(),
            });
        };

        let timeout_ms = self.settings.startup_timeout_ms;
        let read = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            read_endpoint(&self.endpoint_pattern, BufReader::new(stderr).lines()),
        )
        .await;

        let (endpoint, rest) = match read {
            Ok(Ok(found)) => found,
            Ok(Err(tail)) => {
                discard(child, &profile_dir).await;
                return Err(classify_startup_failure(tail));
            }
            Err(_) => {
                discard(child, &profile_dir).await;
                return Err(LaunchError::StartupTimeout { timeout_ms });
            }
        };

        // 继续读取 stderr，避免管道写满阻塞浏览器
        tokio::spawn(drain_stderr(pid, rest));

        if let Err(e) = probe_endpoint(&endpoint).await {
            discard(child, &profile_dir).await;
            return Err(e);
        }

        lock(&self.children).insert(pid, OwnedBrowser { child, profile_dir });
        debug!("[任务 {}] 浏览器 pid {} 调试地址: {}", options.job_id, pid, endpoint);

        Ok(LaunchedBrowser {
            process_id: pid,
            endpoint,
        })
    }

    async fn kill(&self, process_id: u32) -> Result<(), SupervisorError> {
        let owned = lock(&self.children).remove(&process_id);
        let Some(mut owned) = owned else {
            return kill_orphan(process_id).await;
        };

        let result = match owned.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => owned
                .child
                .kill()
                .await
                .map_err(|e| SupervisorError::kill_failed(process_id, e)),
        };

        match result {
            Ok(()) => {
                remove_profile_dir(&owned.profile_dir).await;
                Ok(())
            }
            Err(e) => {
                lock(&self.children).insert(process_id, owned);
                Err(e)
            }
        }
    }
}

/// 读取 stderr 直到出现调试地址；进程提前退出时返回最后几行输出
async fn read_endpoint(
    pattern: &Regex,
    mut lines: Lines<BufReader<ChildStderr>>,
) -> Result<(String, Lines<BufReader<ChildStderr>>), String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(endpoint) = parse_endpoint(pattern, &line) {
                    return Ok((endpoint, lines));
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                tail.push_back(e.to_string());
                break;
            }
        }
    }
    Err(Vec::from(tail).join(" | "))
}

fn parse_endpoint(pattern: &Regex, line: &str) -> Option<String> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn classify_startup_failure(stderr_tail: String) -> LaunchError {
    if stderr_tail.contains("Address already in use") || stderr_tail.contains("bind() failed") {
        LaunchError::PortInUse {
            detail: stderr_tail,
        }
    } else {
        LaunchError::EndpointNotReported { stderr_tail }
    }
}

async fn drain_stderr(pid: u32, mut lines: Lines<BufReader<ChildStderr>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[浏览器 {}] {}", pid, line);
    }
}

async fn discard(mut child: Child, profile_dir: &Path) {
    if let Err(e) = child.kill().await {
        debug!("终止启动失败的浏览器进程出错: {}", e);
    }
    remove_profile_dir(profile_dir).await;
}

async fn remove_profile_dir(profile_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(profile_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("删除用户目录失败 ({}): {}", profile_dir.display(), e);
        }
    }
}

/// 终止不属于本进程的浏览器（上次运行遗留）
async fn kill_orphan(pid: u32) -> Result<(), SupervisorError> {
    let profile_dir = tokio::task::spawn_blocking(move || kill_marked_process(pid))
        .await
        .map_err(|e| SupervisorError::kill_failed(pid, e))??;
    if let Some(dir) = profile_dir {
        remove_profile_dir(&dir).await;
    }
    Ok(())
}

/// 进程不存在视为成功；命令行不带标记的进程不是我们的，跳过
fn kill_marked_process(pid: u32) -> Result<Option<PathBuf>, SupervisorError> {
    let sys_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );

    let Some(process) = system.process(sys_pid) else {
        debug!("pid {} 已不存在", pid);
        return Ok(None);
    };

    let cmd: Vec<String> = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    if !cmd.iter().any(|arg| arg.contains(PROFILE_MARKER)) {
        warn!("⚠️ pid {} 不是本工具启动的浏览器，跳过", pid);
        return Ok(None);
    }

    let profile_dir = cmd
        .iter()
        .find_map(|arg| arg.strip_prefix(USER_DATA_DIR_FLAG))
        .map(PathBuf::from);
    if process.kill() {
        info!("🧹 已终止遗留浏览器进程 pid {}", pid);
        Ok(profile_dir)
    } else {
        Err(SupervisorError::kill_failed(pid, "发送终止信号失败"))
    }
}

/// 当前平台的候选浏览器路径（Chrome、Edge、Brave、Chromium）
pub fn browser_candidates() -> Vec<PathBuf> {
    let candidates: &[&str] = if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
        ]
    } else if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/microsoft-edge",
            "/usr/bin/brave-browser",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    };
    candidates.iter().map(PathBuf::from).collect()
}

/// 优先使用配置的路径，否则按候选列表查找第一个存在的浏览器
///
/// 只有文件名的配置值（如 `chromium`）交给 PATH 解析。
pub fn resolve_executable(configured: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = configured {
        let bare_name = path.components().count() == 1 && path.parent() == Some(Path::new(""));
        if bare_name || path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::BrowserNotFound {
            searched: vec![path.display().to_string()],
        });
    }

    let candidates = browser_candidates();
    candidates
        .iter()
        .find(|p| p.exists())
        .cloned()
        .ok_or_else(|| ConfigError::BrowserNotFound {
            searched: candidates.iter().map(|p| p.display().to_string()).collect(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobId;

    #[test]
    fn parses_devtools_line() {
        let pattern = Regex::new(r"DevTools listening on (ws://\S+)").unwrap();
        let line = "DevTools listening on ws://127.0.0.1:39123/devtools/browser/4f1c-77aa";
        assert_eq!(
            parse_endpoint(&pattern, line).as_deref(),
            Some("ws://127.0.0.1:39123/devtools/browser/4f1c-77aa")
        );
        assert!(parse_endpoint(&pattern, "[1234:WARNING] something else").is_none());
    }

    #[test]
    fn port_conflicts_are_recognized() {
        let err = classify_startup_failure("bind() failed: Address already in use (98)".into());
        assert!(matches!(err, LaunchError::PortInUse { .. }));
        let err = classify_startup_failure("Segmentation fault".into());
        assert!(matches!(err, LaunchError::EndpointNotReported { .. }));
    }

    #[test]
    fn configured_path_must_exist() {
        let err = resolve_executable(Some(Path::new("/no/such/dir/chrome"))).unwrap_err();
        assert!(matches!(err, ConfigError::BrowserNotFound { searched } if searched.len() == 1));
    }

    #[test]
    fn bare_executable_name_is_accepted() {
        let path = resolve_executable(Some(Path::new("chromium"))).unwrap();
        assert_eq!(path, PathBuf::from("chromium"));
    }

    #[test]
    fn profile_dir_is_marked_and_sanitized() {
        let launcher = ChromeLauncher {
            executable: PathBuf::from("chromium"),
            settings: BrowserSettings::default(),
            profile_root: PathBuf::from("/tmp/profiles"),
            children: Mutex::new(HashMap::new()),
            endpoint_pattern: Regex::new("x").unwrap(),
        };
        let dir = launcher.profile_dir(&LaunchOptions {
            job_id: JobId::new("home/page 1"),
            attempt: 2,
            run_id: "run-42".into(),
        });
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, format!("{PROFILE_MARKER}-run-42-home_page_1-2"));
    }

    #[tokio::test]
    async fn killing_unknown_pid_is_ok() {
        // 远超常见 pid 上限，必然不存在
        let launcher = ChromeLauncher {
            executable: PathBuf::from("chromium"),
            settings: BrowserSettings::default(),
            profile_root: std::env::temp_dir(),
            children: Mutex::new(HashMap::new()),
            endpoint_pattern: Regex::new("x").unwrap(),
        };
        assert!(launcher.kill(u32::MAX - 7).await.is_ok());
    }
}
