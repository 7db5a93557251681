use super::{ArmContext, ArmedStrategy, StrategyError};
use crate::expression::TimeoutExpression;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_TOLERANCE_MINUTES: u64 = 24 * 60;

/// Time out at a wall-clock time of day.
///
/// When today's deadline passed less than `tolerance_minutes` ago the
/// execution times out right away; otherwise the deadline is tomorrow's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineStrategy {
    pub deadline_time: TimeoutExpression,
    pub tolerance_minutes: TimeoutExpression,
}

impl Default for DeadlineStrategy {
    fn default() -> Self {
        Self {
            deadline_time: TimeoutExpression::new("23:59"),
            tolerance_minutes: TimeoutExpression::from_number(1),
        }
    }
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .ok()
}

impl DeadlineStrategy {
    pub fn new(deadline_time: impl Into<TimeoutExpression>, tolerance_minutes: u64) -> Self {
        Self {
            deadline_time: deadline_time.into(),
            tolerance_minutes: TimeoutExpression::from_number(tolerance_minutes),
        }
    }

    pub fn arm(&self, ctx: &ArmContext<'_>) -> Result<ArmedStrategy, StrategyError> {
        let expanded = self.deadline_time.expand(ctx.parameters);
        let time = parse_time(&expanded)
            .ok_or_else(|| StrategyError::InvalidDeadline(expanded.clone()))?;
        let tolerance_minutes = self
            .tolerance_minutes
            .resolve_value(ctx.parameters)
            .unwrap_or(0)
            .min(MAX_TOLERANCE_MINUTES);
        let tolerance = ChronoDuration::minutes(tolerance_minutes as i64);

        let (deadline, remaining) = next_deadline(&ctx.wall_clock, time, tolerance)?;
        let effective = remaining.to_std().unwrap_or(Duration::ZERO).max(ctx.floor);
        tracing::debug!(%deadline, remaining_secs = effective.as_secs(), "deadline armed");
        Ok(ArmedStrategy::deadline(
            ctx.started,
            effective,
            format!(
                "deadline {} ({} seconds)",
                deadline.format("%Y-%m-%d %H:%M:%S"),
                effective.as_secs()
            ),
        ))
    }
}

/// The deadline for `time` as seen from `now`, and how far away it is.
fn next_deadline<Tz: TimeZone>(
    now: &DateTime<Tz>,
    time: NaiveTime,
    tolerance: ChronoDuration,
) -> Result<(DateTime<Tz>, ChronoDuration), StrategyError> {
    let naive = now.date_naive().and_time(time);
    let mut deadline = now
        .timezone()
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| StrategyError::NonexistentLocalTime(naive.to_string()))?;

    let remaining = if deadline > *now {
        deadline.clone() - now.clone()
    } else if now.clone() - deadline.clone() <= tolerance {
        ChronoDuration::zero()
    } else {
        deadline = deadline + ChronoDuration::days(1);
        deadline.clone() - now.clone()
    };
    Ok((deadline, remaining))
}
