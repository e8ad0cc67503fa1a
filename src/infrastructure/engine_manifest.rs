//! 引擎清单 `engine.manifest.json`
//!
//! 查找顺序：配置的路径 → 缓存目录 `<cache>/audit-pool/engine/` → 程序所在目录 → 程序上级目录

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;
pub const MANIFEST_FILE_NAME: &str = "engine.manifest.json";
const CACHE_DIR_NAME: &str = "audit-pool";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineManifest {
    pub schema_version: u32,
    pub engine_version: String,
    /// 最低 Node 版本，如 `"20"` 或 `"20.11.0"`
    pub min_node: String,
    /// 相对清单所在目录的入口脚本
    pub entry: String,
    #[serde(default)]
    pub default_output_dir_name: Option<String>,
}

impl EngineManifest {
    pub fn min_node_major(&self) -> Option<u32> {
        parse_node_major(&self.min_node)
    }
}

/// 解析完成、入口已确认存在的引擎
#[derive(Debug, Clone)]
pub struct ResolvedEngine {
    pub manifest_path: PathBuf,
    pub manifest: EngineManifest,
    pub entry_path: PathBuf,
}

/// 缓存目录：Windows 用 `LOCALAPPDATA`，其他平台用 `XDG_CACHE_HOME` 或 `~/.cache`
pub fn cache_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Ok(local_app_data) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(local_app_data).join(CACHE_DIR_NAME);
        }
    }
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join(CACHE_DIR_NAME);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache").join(CACHE_DIR_NAME);
    }
    std::env::temp_dir().join(CACHE_DIR_NAME)
}

/// 按查找顺序列出清单候选路径
pub fn manifest_candidates(
    configured: &Path,
    cache_dir: &Path,
    exe_dir: Option<&Path>,
) -> Vec<PathBuf> {
    let mut candidates = vec![
        configured.to_path_buf(),
        cache_dir.join("engine").join(MANIFEST_FILE_NAME),
    ];
    if let Some(exe_dir) = exe_dir {
        candidates.push(exe_dir.join(MANIFEST_FILE_NAME));
        if let Some(parent) = exe_dir.parent() {
            candidates.push(parent.join(MANIFEST_FILE_NAME));
        }
    }
    candidates.dedup();
    candidates
}

/// 返回第一个存在的候选清单
pub fn locate_manifest(candidates: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    candidates
        .iter()
        .find(|path| path.is_file())
        .cloned()
        .ok_or_else(|| ConfigError::ManifestNotFound {
            searched: candidates.iter().map(|p| p.display().to_string()).collect(),
        })
}

/// 从配置路径出发查找清单，找不到时依次尝试缓存目录和程序目录
pub fn resolve_engine_from(configured: &Path) -> Result<ResolvedEngine, ConfigError> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let candidates = manifest_candidates(configured, &cache_dir(), exe_dir.as_deref());
    let manifest_path = locate_manifest(&candidates)?;
    if manifest_path != configured {
        debug!("配置的引擎清单不存在，使用 {}", manifest_path.display());
    }
    resolve_engine(&manifest_path)
}

/// 读取清单并定位入口脚本
pub fn resolve_engine(manifest_path: &Path) -> Result<ResolvedEngine, ConfigError> {
    let content =
        std::fs::read_to_string(manifest_path).map_err(|source| ConfigError::ReadFailed {
            path: manifest_path.display().to_string(),
            source,
        })?;
    let manifest = parse_manifest(manifest_path, &content)?;

    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let entry_path = base.join(&manifest.entry);
    if !entry_path.exists() {
        return Err(invalid(
            manifest_path,
            format!("入口文件不存在: {}", entry_path.display()),
        ));
    }

    Ok(ResolvedEngine {
        manifest_path: manifest_path.to_path_buf(),
        manifest,
        entry_path,
    })
}

fn parse_manifest(manifest_path: &Path, content: &str) -> Result<EngineManifest, ConfigError> {
    let manifest: EngineManifest =
        serde_json::from_str(content).map_err(|e| invalid(manifest_path, e.to_string()))?;
    if manifest.schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(invalid(
            manifest_path,
            format!("不支持的 schemaVersion: {}", manifest.schema_version),
        ));
    }
    if manifest.entry.trim().is_empty() {
        return Err(invalid(manifest_path, "entry 为空"));
    }
    Ok(manifest)
}

fn invalid(path: &Path, reason: impl Into<String>) -> ConfigError {
    ConfigError::ManifestInvalid {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// 从 `v20.11.1` / `20` 这类字符串取主版本号
pub fn parse_node_major(version: &str) -> Option<u32> {
    let trimmed = version.trim();
    let without_v = trimmed.strip_prefix('v').unwrap_or(trimmed);
    without_v.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "schemaVersion": 1,
        "engineVersion": "3.2.0",
        "minNode": "20",
        "entry": "dist/bin.js",
        "defaultOutputDirName": ".signaler"
    }"#;

    #[test]
    fn parses_manifest_fields() {
        let manifest = parse_manifest(Path::new("engine.manifest.json"), MANIFEST).unwrap();
        assert_eq!(manifest.engine_version, "3.2.0");
        assert_eq!(manifest.entry, "dist/bin.js");
        assert_eq!(manifest.min_node_major(), Some(20));
    }

    #[test]
    fn rejects_unknown_schema() {
        let content = MANIFEST.replace("\"schemaVersion\": 1", "\"schemaVersion\": 2");
        let err = parse_manifest(Path::new("m.json"), &content).unwrap_err();
        assert!(matches!(err, ConfigError::ManifestInvalid { reason, .. } if reason.contains("schemaVersion")));
    }

    #[test]
    fn missing_entry_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("audit-pool-manifest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let err = resolve_engine(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ManifestInvalid { .. }));

        std::fs::create_dir_all(dir.join("dist")).unwrap();
        std::fs::write(dir.join("dist/bin.js"), "").unwrap();
        let resolved = resolve_engine(&path).unwrap();
        assert_eq!(resolved.entry_path, dir.join("dist/bin.js"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn candidates_follow_lookup_order() {
        let candidates = manifest_candidates(
            Path::new("engine/engine.manifest.json"),
            Path::new("/cache/audit-pool"),
            Some(Path::new("/opt/audit/bin")),
        );
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("engine/engine.manifest.json"),
                PathBuf::from("/cache/audit-pool/engine/engine.manifest.json"),
                PathBuf::from("/opt/audit/bin/engine.manifest.json"),
                PathBuf::from("/opt/audit/engine.manifest.json"),
            ]
        );
    }

    #[test]
    fn falls_back_to_first_existing_candidate() {
        let dir = std::env::temp_dir().join(format!("audit-pool-locate-{}", std::process::id()));
        let cache = dir.join("cache");
        std::fs::create_dir_all(cache.join("engine")).unwrap();
        let cached = cache.join("engine").join(MANIFEST_FILE_NAME);
        std::fs::write(&cached, MANIFEST).unwrap();

        let candidates = manifest_candidates(&dir.join("missing.json"), &cache, None);
        assert_eq!(locate_manifest(&candidates).unwrap(), cached);

        std::fs::remove_file(&cached).unwrap();
        let err = locate_manifest(&candidates).unwrap_err();
        assert!(matches!(err, ConfigError::ManifestNotFound { searched } if searched.len() == 2));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn node_major_versions() {
        assert_eq!(parse_node_major("v20.11.1"), Some(20));
        assert_eq!(parse_node_major("18"), Some(18));
        assert_eq!(parse_node_major(" v22.0.0\n"), Some(22));
        assert_eq!(parse_node_major("latest"), None);
    }
}
