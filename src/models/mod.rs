pub mod job;
pub mod loaders;
pub mod result;

pub use job::{AuditJob, JobId, JobState};
pub use loaders::{load_plan, AuditPlan, PlanEntry};
pub use result::{AuditOutcome, AuditResult, Metrics};
