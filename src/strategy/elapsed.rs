use super::{ArmContext, ArmedStrategy};
use crate::expression::TimeoutExpression;
use serde::{Deserialize, Serialize};

/// Time out once the execution has run for `timeout_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElapsedStrategy {
    pub timeout_secs: TimeoutExpression,
}

impl ElapsedStrategy {
    pub fn new(timeout_secs: impl Into<TimeoutExpression>) -> Self {
        Self {
            timeout_secs: timeout_secs.into(),
        }
    }

    pub fn arm(&self, ctx: &ArmContext<'_>) -> ArmedStrategy {
        let effective = self.timeout_secs.effective(ctx.parameters, ctx.floor);
        ArmedStrategy::deadline(
            ctx.started,
            effective,
            format!("elapsed time over {} seconds", effective.as_secs()),
        )
    }
}

impl Default for ElapsedStrategy {
    fn default() -> Self {
        Self::new(180)
    }
}
