/// The job being supervised and the per-execution state shared between the
/// job, the watchdog, and the timeout operations.
use crate::activity::ActivityMonitor;
use crate::expression::Parameters;
use crate::operations::TriggerLatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Terminal status of an execution, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl BuildResult {
    /// Process exit code reported by the CLI.
    pub fn exit_code(self) -> u8 {
        match self {
            BuildResult::Success | BuildResult::Unstable => 0,
            BuildResult::Failure => 1,
            BuildResult::Aborted => 2,
            BuildResult::NotBuilt => 3,
        }
    }
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::Failure => "FAILURE",
            BuildResult::NotBuilt => "NOT_BUILT",
            BuildResult::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Append-only console log of one execution.
///
/// Every line appended counts as activity for the execution's monitor.
#[derive(Debug, Clone)]
pub struct Console {
    lines: Arc<Mutex<Vec<String>>>,
    activity: Arc<ActivityMonitor>,
}

impl Console {
    pub fn new(activity: Arc<ActivityMonitor>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            activity,
        }
    }

    pub fn println(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(target: "build_timeout::console", "{line}");
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
        self.activity.observe();
    }

    /// Snapshot of everything logged so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn activity(&self) -> &Arc<ActivityMonitor> {
        &self.activity
    }
}

/// What a job receives when it is started.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub console: Console,
    /// Cancelled when the supervisor requests interruption. Jobs are expected
    /// to check it and wind down promptly.
    pub interrupt: CancellationToken,
    pub parameters: Arc<Parameters>,
}

/// A unit of work run under supervision.
#[async_trait]
pub trait Job: Send {
    fn name(&self) -> &str;

    /// Run to a terminal state. Interruption is cooperative: the job observes
    /// `ctx.interrupt` and returns its own result when it stops.
    async fn run(&mut self, ctx: JobContext) -> BuildResult;
}

/// State of one supervised execution.
#[derive(Debug)]
pub struct Execution {
    name: String,
    console: Console,
    interrupt: CancellationToken,
    kill: CancellationToken,
    latch: TriggerLatch,
    result_override: Mutex<Option<BuildResult>>,
    description: Mutex<Option<String>>,
    restart_limit: Mutex<Option<u32>>,
    interrupted_manually: AtomicBool,
}

impl Execution {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            console: Console::new(Arc::new(ActivityMonitor::new())),
            interrupt: CancellationToken::new(),
            kill: CancellationToken::new(),
            latch: TriggerLatch::new(),
            result_override: Mutex::new(None),
            description: Mutex::new(None),
            restart_limit: Mutex::new(None),
            interrupted_manually: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn latch(&self) -> &TriggerLatch {
        &self.latch
    }

    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    /// Ask the job to stop. Repeated requests are harmless.
    pub fn request_interrupt(&self) {
        if !self.interrupt.is_cancelled() {
            tracing::info!(job = %self.name, "requesting job interruption");
            self.interrupt.cancel();
        }
    }

    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Stop waiting for the job to wind down and drop it right away.
    pub fn force_kill(&self) {
        if !self.kill.is_cancelled() {
            tracing::warn!(job = %self.name, "forcing job kill");
            self.kill.cancel();
        }
        self.request_interrupt();
    }

    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Interrupt on behalf of a user (e.g. Ctrl-C).
    ///
    /// Competes with the timeout for the same latch; returns false when the
    /// execution already timed out or completed.
    pub fn interrupt_manually(&self) -> bool {
        if !self.latch.try_interrupt() {
            return false;
        }
        self.interrupted_manually.store(true, Ordering::Release);
        self.console.println("Aborted by user");
        self.set_result(BuildResult::Aborted);
        self.request_interrupt();
        true
    }

    pub fn interrupted_manually(&self) -> bool {
        self.interrupted_manually.load(Ordering::Acquire)
    }

    /// Record the result the execution must report. When several callers set
    /// one, the worst result wins.
    pub fn set_result(&self, result: BuildResult) {
        let mut slot = self
            .result_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(slot.map_or(result, |current| current.max(result)));
    }

    pub fn result_override(&self) -> Option<BuildResult> {
        *self
            .result_override
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_description(&self, description: impl Into<String>) {
        *self
            .description
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(description.into());
    }

    pub fn description(&self) -> Option<String> {
        self.description
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_restart(&self, max_restarts: u32) {
        *self
            .restart_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(max_restarts);
    }

    pub fn restart_limit(&self) -> Option<u32> {
        *self
            .restart_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
