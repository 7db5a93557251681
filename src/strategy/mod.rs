pub mod deadline;
pub mod elapsed;
pub mod elastic;
pub mod likely_stuck;
pub mod no_activity;

pub use deadline::DeadlineStrategy;
pub use elapsed::ElapsedStrategy;
pub use elastic::ElasticStrategy;
pub use likely_stuck::LikelyStuckStrategy;
pub use no_activity::NoActivityStrategy;

use crate::activity::ActivityMonitor;
use crate::expression::{Parameters, TimeoutExpression};
use crate::history::BuildHistory;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Everything a strategy may consult when an execution starts.
pub struct ArmContext<'a> {
    /// When the execution started (monotonic).
    pub started: Instant,
    /// Wall-clock time at the same moment.
    pub wall_clock: DateTime<Local>,
    pub parameters: &'a Parameters,
    pub floor: Duration,
    pub activity: &'a Arc<ActivityMonitor>,
    pub history: &'a BuildHistory,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("invalid deadline time {0:?}, expected HH:MM or HH:MM:SS")]
    InvalidDeadline(String),
    #[error("deadline {0} does not exist in the local time zone")]
    NonexistentLocalTime(String),
}

/// How a timeout is decided, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeoutStrategy {
    Elapsed(ElapsedStrategy),
    NoActivity(NoActivityStrategy),
    Elastic(ElasticStrategy),
    LikelyStuck(LikelyStuckStrategy),
    Deadline(DeadlineStrategy),
}

impl Default for TimeoutStrategy {
    fn default() -> Self {
        TimeoutStrategy::Elapsed(ElapsedStrategy::default())
    }
}

impl TimeoutStrategy {
    /// Resolve the configuration for one execution.
    pub fn arm(&self, ctx: &ArmContext<'_>) -> Result<ArmedStrategy, StrategyError> {
        match self {
            TimeoutStrategy::Elapsed(s) => Ok(s.arm(ctx)),
            TimeoutStrategy::NoActivity(s) => Ok(s.arm(ctx)),
            TimeoutStrategy::Elastic(s) => Ok(s.arm(ctx)),
            TimeoutStrategy::LikelyStuck(s) => Ok(s.arm(ctx)),
            TimeoutStrategy::Deadline(s) => s.arm(ctx),
        }
    }

    /// The primary user-authored timeout expression, if the variant has one.
    pub fn expression(&self) -> Option<&TimeoutExpression> {
        match self {
            TimeoutStrategy::Elapsed(s) => Some(&s.timeout_secs),
            TimeoutStrategy::NoActivity(s) => Some(&s.timeout_secs),
            TimeoutStrategy::Elastic(s) => Some(&s.percentage),
            TimeoutStrategy::LikelyStuck(_) => None,
            TimeoutStrategy::Deadline(s) => Some(&s.deadline_time),
        }
    }

    /// Replace the primary expression. Returns false when the variant has none.
    pub fn set_expression(&mut self, expression: TimeoutExpression) -> bool {
        match self {
            TimeoutStrategy::Elapsed(s) => s.timeout_secs = expression,
            TimeoutStrategy::NoActivity(s) => s.timeout_secs = expression,
            TimeoutStrategy::Elastic(s) => s.percentage = expression,
            TimeoutStrategy::LikelyStuck(_) => return false,
            TimeoutStrategy::Deadline(s) => s.deadline_time = expression,
        }
        true
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TimeoutStrategy::Elapsed(_) => "elapsed",
            TimeoutStrategy::NoActivity(_) => "no_activity",
            TimeoutStrategy::Elastic(_) => "elastic",
            TimeoutStrategy::LikelyStuck(_) => "likely_stuck",
            TimeoutStrategy::Deadline(_) => "deadline",
        }
    }
}

/// What a watchdog compares against on each poll.
#[derive(Debug, Clone)]
enum Trigger {
    /// Fire once `now >= deadline`. `None` when the deadline lies beyond
    /// what the clock can represent, so it never fires.
    Deadline(Option<Instant>),
    /// Fire once the job has been silent for the effective timeout.
    Inactivity(Arc<ActivityMonitor>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Running,
    TimedOut { effective: Duration },
}

/// A strategy resolved for one execution.
#[derive(Debug, Clone)]
pub struct ArmedStrategy {
    trigger: Trigger,
    effective: Duration,
    description: String,
}

impl ArmedStrategy {
    pub fn deadline(started: Instant, effective: Duration, description: String) -> Self {
        Self {
            trigger: Trigger::Deadline(started.checked_add(effective)),
            effective,
            description,
        }
    }

    pub fn inactivity(
        monitor: Arc<ActivityMonitor>,
        effective: Duration,
        description: String,
    ) -> Self {
        Self {
            trigger: Trigger::Inactivity(monitor),
            effective,
            description,
        }
    }

    pub fn poll_once(&self, now: Instant) -> Verdict {
        let expired = match &self.trigger {
            Trigger::Deadline(deadline) => deadline.is_some_and(|deadline| now >= deadline),
            Trigger::Inactivity(monitor) => monitor.idle_at(now) >= self.effective,
        };
        if expired {
            Verdict::TimedOut {
                effective: self.effective,
            }
        } else {
            Verdict::Running
        }
    }

    /// The timeout actually in force, after resolution and clamping.
    pub fn effective(&self) -> Duration {
        self.effective
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}
