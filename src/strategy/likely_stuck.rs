use super::{ArmContext, ArmedStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multiple of the estimated duration after which a job is considered stuck.
const STUCK_FACTOR: u32 = 10;

/// Used when there is no estimate to work from.
const NO_ESTIMATE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Time out once the job has run ten times longer than it usually takes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikelyStuckStrategy {}

impl LikelyStuckStrategy {
    pub fn arm(&self, ctx: &ArmContext<'_>) -> ArmedStrategy {
        let timeout = match ctx.history.estimated_duration() {
            Some(estimate) if !estimate.is_zero() => estimate.saturating_mul(STUCK_FACTOR),
            _ => NO_ESTIMATE_TIMEOUT,
        };
        let effective = timeout.max(ctx.floor);
        ArmedStrategy::deadline(
            ctx.started,
            effective,
            format!("likely stuck after {} seconds", effective.as_secs()),
        )
    }
}
