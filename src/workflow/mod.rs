pub mod attempt_ctx;
pub mod attempt_flow;

pub use attempt_ctx::AttemptCtx;
pub use attempt_flow::{validate_url, AttemptFlow, AttemptOutcome};
