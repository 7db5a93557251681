/// Polling loop that evaluates an armed strategy for one execution.
///
/// Runs alongside the job. On the first timed-out poll it fires the
/// operation pipeline and stops; if the supervisor cancels it first, it
/// stops without firing.
use crate::job::Execution;
use crate::operations::OperationPipeline;
use crate::strategy::{ArmedStrategy, Verdict};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a watchdog run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The strategy timed out and this watchdog ran the pipeline.
    Fired { effective: Duration },
    /// The strategy timed out, but the execution had already settled.
    Suppressed,
    /// Stopped by the supervisor.
    Cancelled,
}

pub struct Watchdog {
    strategy: ArmedStrategy,
    poll_interval: Duration,
}

impl Watchdog {
    pub fn new(strategy: ArmedStrategy, poll_interval: Duration) -> Self {
        Self {
            strategy,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub async fn monitor(
        self,
        execution: Arc<Execution>,
        pipeline: Arc<OperationPipeline>,
        stop: CancellationToken,
    ) -> WatchdogOutcome {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(
            job = %execution.name(),
            strategy = self.strategy.description(),
            poll_ms = self.poll_interval.as_millis() as u64,
            "watchdog started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    tracing::debug!(job = %execution.name(), "watchdog cancelled");
                    return WatchdogOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
            }

            if stop.is_cancelled() {
                return WatchdogOutcome::Cancelled;
            }

            if let Verdict::TimedOut { effective } = self.strategy.poll_once(Instant::now()) {
                return if pipeline.fire(&execution, effective) {
                    WatchdogOutcome::Fired { effective }
                } else {
                    WatchdogOutcome::Suppressed
                };
            }
        }
    }
}
