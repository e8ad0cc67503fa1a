pub mod plan_loader;

pub use plan_loader::{jobs_from_plan, load_plan, parse_plan, AuditPlan, PlanEntry};
