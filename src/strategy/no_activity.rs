use super::{ArmContext, ArmedStrategy};
use crate::expression::{Parameters, TimeoutExpression};
use serde::{Deserialize, Serialize};

/// Time out once the job has produced no output for `timeout_secs`.
///
/// The expression is resolved once, when the execution starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoActivityStrategy {
    pub timeout_secs: TimeoutExpression,
}

impl NoActivityStrategy {
    pub fn new(timeout_secs: impl Into<TimeoutExpression>) -> Self {
        Self {
            timeout_secs: timeout_secs.into(),
        }
    }

    /// Configured seconds without any parameters bound; 0 when the
    /// expression needs parameters or is not a number.
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_secs.resolve(&Parameters::new()).seconds
    }

    pub fn arm(&self, ctx: &ArmContext<'_>) -> ArmedStrategy {
        let effective = self.timeout_secs.effective(ctx.parameters, ctx.floor);
        ArmedStrategy::inactivity(
            ctx.activity.clone(),
            effective,
            format!("no activity for {} seconds", effective.as_secs()),
        )
    }
}

impl Default for NoActivityStrategy {
    fn default() -> Self {
        Self::new(180)
    }
}
