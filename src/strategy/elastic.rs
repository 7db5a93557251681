use super::{ArmContext, ArmedStrategy};
use crate::expression::TimeoutExpression;
use crate::history;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time out at a percentage of the average duration of recent successful
/// executions, or after `fallback_minutes` when there are none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticStrategy {
    pub percentage: TimeoutExpression,
    pub builds_to_consider: u32,
    pub fallback_minutes: TimeoutExpression,
}

impl Default for ElasticStrategy {
    fn default() -> Self {
        Self {
            percentage: TimeoutExpression::from_number(150),
            builds_to_consider: 3,
            fallback_minutes: TimeoutExpression::from_number(60),
        }
    }
}

impl ElasticStrategy {
    pub fn arm(&self, ctx: &ArmContext<'_>) -> ArmedStrategy {
        let durations = ctx
            .history
            .successful_durations(self.builds_to_consider as usize);

        let timeout = match history::average(&durations) {
            Some(avg) => {
                let percentage = match self.percentage.resolve_value(ctx.parameters) {
                    Some(percentage) => percentage,
                    None => {
                        tracing::warn!(
                            expression = %self.percentage,
                            "elastic percentage did not resolve, using 0"
                        );
                        0
                    }
                };
                let millis = (avg.as_millis() as u64).saturating_mul(percentage) / 100;
                Duration::from_millis(millis)
            }
            None => {
                let minutes = self.fallback_minutes.resolve_value(ctx.parameters).unwrap_or(0);
                tracing::debug!(minutes, "no successful history, using elastic fallback");
                Duration::from_secs(minutes.saturating_mul(60))
            }
        };

        let effective = timeout.max(ctx.floor);
        ArmedStrategy::deadline(
            ctx.started,
            effective,
            format!("elastic timeout of {} seconds", effective.as_secs()),
        )
    }
}
