/// Operations run when an execution times out, and the latch that makes sure
/// they run at most once.
use crate::job::{BuildResult, Execution};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const RUNNING: u8 = 0;
const TIMED_OUT: u8 = 1;
const COMPLETED: u8 = 2;
const INTERRUPTED: u8 = 3;

/// Terminal state an execution settled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchState {
    Running,
    TimedOut,
    Completed,
    Interrupted,
}

/// One-shot latch per execution.
///
/// The first of timeout, natural completion, or manual interruption to claim
/// it wins; every later claim fails. Each claim is a single compare-and-swap.
#[derive(Debug)]
pub struct TriggerLatch(AtomicU8);

impl TriggerLatch {
    pub fn new() -> Self {
        Self(AtomicU8::new(RUNNING))
    }

    fn claim(&self, state: u8) -> bool {
        self.0
            .compare_exchange(RUNNING, state, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim for a timeout. True only for the first successful claim.
    pub fn try_fire(&self) -> bool {
        self.claim(TIMED_OUT)
    }

    pub fn try_complete(&self) -> bool {
        self.claim(COMPLETED)
    }

    pub fn try_interrupt(&self) -> bool {
        self.claim(INTERRUPTED)
    }

    pub fn state(&self) -> LatchState {
        match self.0.load(Ordering::Acquire) {
            TIMED_OUT => LatchState::TimedOut,
            COMPLETED => LatchState::Completed,
            INTERRUPTED => LatchState::Interrupted,
            _ => LatchState::Running,
        }
    }
}

impl Default for TriggerLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("{operation}: {reason}")]
    Failed { operation: String, reason: String },
}

/// A remediation action performed when an execution times out.
pub trait TimeoutOperation: Send + Sync {
    fn name(&self) -> &str;

    fn perform(&self, execution: &Execution, effective: Duration) -> Result<(), OperationError>;
}

/// Built-in operations, as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationSpec {
    /// Abort the execution.
    Abort,
    /// Fail the execution.
    Fail,
    /// Set the execution description. `{0}` becomes the timeout in minutes.
    WriteDescription { description: String },
    /// Abort, then run the execution again up to `max_restarts` times.
    AbortAndRestart { max_restarts: u32 },
}

fn minutes(effective: Duration) -> u64 {
    effective.as_secs() / 60
}

fn interrupt_with(execution: &Execution, result: BuildResult, effective: Duration, verb: &str) {
    execution.console().println(format!(
        "Build timed out (after {} minutes). Marking the build as {verb}.",
        minutes(effective)
    ));
    execution.set_result(result);
    execution.request_interrupt();
}

impl TimeoutOperation for OperationSpec {
    fn name(&self) -> &str {
        match self {
            OperationSpec::Abort => "abort",
            OperationSpec::Fail => "fail",
            OperationSpec::WriteDescription { .. } => "write_description",
            OperationSpec::AbortAndRestart { .. } => "abort_and_restart",
        }
    }

    fn perform(&self, execution: &Execution, effective: Duration) -> Result<(), OperationError> {
        match self {
            OperationSpec::Abort => {
                interrupt_with(execution, BuildResult::Aborted, effective, "aborted")
            }
            OperationSpec::Fail => {
                interrupt_with(execution, BuildResult::Failure, effective, "failed")
            }
            OperationSpec::WriteDescription { description } => {
                let text = description.replace("{0}", &minutes(effective).to_string());
                execution.console().println(format!("Setting description: {text}"));
                execution.set_description(text);
            }
            OperationSpec::AbortAndRestart { max_restarts } => {
                interrupt_with(execution, BuildResult::Aborted, effective, "aborted");
                execution.request_restart(*max_restarts);
            }
        }
        Ok(())
    }
}

/// Ordered operations for one execution, fired at most once.
pub struct OperationPipeline {
    operations: Vec<Arc<dyn TimeoutOperation>>,
}

impl OperationPipeline {
    /// An empty list falls back to aborting the execution.
    pub fn new(operations: Vec<Arc<dyn TimeoutOperation>>) -> Self {
        let operations = if operations.is_empty() {
            vec![Arc::new(OperationSpec::Abort) as Arc<dyn TimeoutOperation>]
        } else {
            operations
        };
        Self { operations }
    }

    pub fn from_specs(specs: &[OperationSpec]) -> Self {
        Self::new(
            specs
                .iter()
                .cloned()
                .map(|spec| Arc::new(spec) as Arc<dyn TimeoutOperation>)
                .collect(),
        )
    }

    /// Operations for the older two-flag configuration style.
    pub fn legacy(fail_build: bool, write_description: bool) -> Self {
        let mut specs = vec![if fail_build {
            OperationSpec::Fail
        } else {
            OperationSpec::Abort
        }];
        if write_description {
            specs.push(OperationSpec::WriteDescription {
                description: "Timed out after {0} minutes".to_string(),
            });
        }
        Self::from_specs(&specs)
    }

    pub fn names(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.name()).collect()
    }

    /// Claim the execution's latch and run every operation in order.
    ///
    /// Returns false without doing anything when the latch was already
    /// claimed. A failing or panicking operation is logged and the rest
    /// still run.
    pub fn fire(&self, execution: &Execution, effective: Duration) -> bool {
        if !execution.latch().try_fire() {
            tracing::debug!(
                job = %execution.name(),
                state = ?execution.latch().state(),
                "timeout trigger ignored, execution already settled"
            );
            return false;
        }

        tracing::warn!(
            job = %execution.name(),
            effective_ms = effective.as_millis() as u64,
            operations = ?self.names(),
            "execution timed out, running timeout operations"
        );

        for op in &self.operations {
            match catch_unwind(AssertUnwindSafe(|| op.perform(execution, effective))) {
                Ok(Ok(())) => tracing::debug!(operation = op.name(), "timeout operation done"),
                Ok(Err(e)) => {
                    tracing::warn!(operation = op.name(), error = %e, "timeout operation failed");
                    execution
                        .console()
                        .println(format!("Timeout operation {} failed: {e}", op.name()));
                }
                Err(_) => {
                    tracing::error!(operation = op.name(), "timeout operation panicked");
                    execution
                        .console()
                        .println(format!("Timeout operation {} panicked", op.name()));
                }
            }
        }
        true
    }
}
