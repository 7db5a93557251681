use crate::supervisor::ExecutionReport;
use tracing::warn;

/// Decision returned by the restart policy after an execution ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Execution is final.
    Finish,
    /// Run the execution again (includes 1-based restart number).
    Restart { attempt: u32 },
}

/// Restart policy for executions aborted by `abort_and_restart`.
///
/// The limit comes from the operation that requested the restart. Each
/// restart is a fresh execution, so its timeout is resolved again.
pub struct RetryPolicy {
    restarts: u32,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self { restarts: 0 }
    }

    pub fn evaluate(&mut self, report: &ExecutionReport) -> RetryDecision {
        let Some(limit) = report.restart_limit else {
            return RetryDecision::Finish;
        };
        if report.interrupted_manually {
            return RetryDecision::Finish;
        }

        if self.restarts < limit {
            self.restarts += 1;
            warn!(
                attempt = self.restarts,
                max_restarts = limit,
                "execution timed out, restarting"
            );
            RetryDecision::Restart {
                attempt: self.restarts,
            }
        } else {
            warn!(max_restarts = limit, "restarts exhausted, giving up");
            RetryDecision::Finish
        }
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}
