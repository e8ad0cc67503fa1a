//! 执行上下文
//!
//! 封装"哪个任务的第几次执行，在哪个槽位上"这一信息

use std::fmt::Display;

use crate::models::JobId;

/// 单次执行的上下文
#[derive(Debug, Clone)]
pub struct AttemptCtx {
    pub job_id: JobId,
    pub url: String,

    /// 在计划中的位置
    pub plan_index: usize,

    /// 执行序号（从1开始）
    pub attempt: u32,

    pub slot_id: usize,
}

impl AttemptCtx {
    pub fn new(
        job_id: JobId,
        url: String,
        plan_index: usize,
        attempt: u32,
        slot_id: usize,
    ) -> Self {
        Self {
            job_id,
            url,
            plan_index,
            attempt,
            slot_id,
        }
    }
}

impl Display for AttemptCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[任务 {} 第{}次 槽位#{}]",
            self.job_id, self.attempt, self.slot_id
        )
    }
}
