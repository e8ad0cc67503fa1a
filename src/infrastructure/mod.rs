//! 基础设施层（Infrastructure）
//!
//! 持有外部审计引擎这一稀缺资源，只暴露"审计一个 URL"的能力

pub mod audit_engine;
pub mod engine_manifest;
pub mod node_engine;

pub use audit_engine::AuditEngine;
pub use engine_manifest::{
    locate_manifest, manifest_candidates, resolve_engine, resolve_engine_from, EngineManifest,
    ResolvedEngine,
};
pub use node_engine::NodeAuditEngine;
