/// Runs one job under a timeout strategy.
///
/// The job runs in its own task, the watchdog in another. Whichever settles
/// the execution's latch first decides the outcome: a job that finishes
/// before the watchdog fires reports its own result untouched; a watchdog
/// that fires first runs the timeout operations, and the supervisor then
/// waits (bounded, once interruption was requested) for the job to stop.
use crate::expression::{self, Parameters};
use crate::history::{BuildHistory, ExecutionRecord};
use crate::job::{BuildResult, Execution, Job, JobContext};
use crate::operations::{LatchState, OperationPipeline};
use crate::strategy::{ArmContext, TimeoutStrategy};
use crate::watchdog::{Watchdog, WatchdogOutcome};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Delay between watchdog polls.
    pub poll_interval: Duration,
    /// How long an interrupted job may take to stop before it is abandoned.
    pub interrupt_grace: Duration,
    /// Timeouts below this are raised to it.
    pub minimum_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            interrupt_grace: Duration::from_secs(30),
            minimum_timeout: expression::minimum_timeout(),
        }
    }
}

/// Why and at what value an execution timed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub effective_ms: u64,
    pub strategy: String,
}

/// Final status of one supervised execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub job: String,
    pub result: BuildResult,
    pub timed_out: Option<TimeoutInfo>,
    pub interrupted_manually: bool,
    /// The job did not stop within the grace period and was abandoned.
    pub interrupt_expired: bool,
    pub description: Option<String>,
    pub restart_limit: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub log: Vec<String>,
}

impl ExecutionReport {
    pub fn record(&self) -> ExecutionRecord {
        ExecutionRecord {
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            result: self.result,
            timed_out: self.timed_out.is_some(),
        }
    }
}

enum Race {
    JobDone(Result<BuildResult, JoinError>),
    Watchdog(Result<WatchdogOutcome, JoinError>),
    Interrupted,
}

enum JobEnd {
    Finished(Result<BuildResult, JoinError>),
    Abandoned,
}

pub struct Supervisor {
    options: SupervisorOptions,
    history: BuildHistory,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            history: BuildHistory::new(),
        }
    }

    pub fn with_history(mut self, history: BuildHistory) -> Self {
        self.history = history;
        self
    }

    /// Run `job` in a fresh execution.
    ///
    /// The CLI uses `run_execution` so it can wire up signals first; this is
    /// the entry point for callers that don't need the execution up front.
    #[allow(dead_code)]
    pub async fn run(
        &self,
        job: Box<dyn Job>,
        strategy: &TimeoutStrategy,
        pipeline: Arc<OperationPipeline>,
        parameters: Parameters,
    ) -> ExecutionReport {
        let execution = Execution::new(job.name());
        self.run_execution(execution, job, strategy, pipeline, parameters)
            .await
    }

    /// Run `job` in an execution the caller already holds (e.g. to wire up
    /// manual interruption before the job starts).
    pub async fn run_execution(
        &self,
        execution: Arc<Execution>,
        mut job: Box<dyn Job>,
        strategy: &TimeoutStrategy,
        pipeline: Arc<OperationPipeline>,
        parameters: Parameters,
    ) -> ExecutionReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let activity = execution.console().activity().clone();
        activity.observe();

        let armed = {
            let ctx = ArmContext {
                started,
                wall_clock: Local::now(),
                parameters: &parameters,
                floor: self.options.minimum_timeout,
                activity: &activity,
                history: &self.history,
            };
            match strategy.arm(&ctx) {
                Ok(armed) => Some(armed),
                Err(e) => {
                    tracing::warn!(
                        job = %execution.name(),
                        error = %e,
                        "timeout strategy could not be armed, running without a watchdog"
                    );
                    execution
                        .console()
                        .println(format!("Timeout not armed: {e}"));
                    None
                }
            }
        };

        if let Some(armed) = &armed {
            tracing::info!(
                job = %execution.name(),
                strategy = armed.description(),
                effective_ms = armed.effective().as_millis() as u64,
                "supervising execution"
            );
        }

        let job_ctx = JobContext {
            console: execution.console().clone(),
            interrupt: execution.interrupt_token().clone(),
            parameters: Arc::new(parameters),
        };
        let job_execution = execution.clone();
        let mut job_task: JoinHandle<BuildResult> = tokio::spawn(async move {
            let result = job.run(job_ctx).await;
            job_execution.latch().try_complete();
            result
        });

        let end = match &armed {
            None => self.await_job(&mut job_task, &execution).await,
            Some(armed) => {
                let stop = CancellationToken::new();
                let mut watchdog = tokio::spawn(
                    Watchdog::new(armed.clone(), self.options.poll_interval).monitor(
                        execution.clone(),
                        pipeline,
                        stop.clone(),
                    ),
                );

                let race = tokio::select! {
                    biased;
                    joined = &mut job_task => Race::JobDone(joined),
                    watched = &mut watchdog => Race::Watchdog(watched),
                    _ = execution.interrupt_token().cancelled() => Race::Interrupted,
                };
                stop.cancel();

                match race {
                    Race::JobDone(joined) => {
                        if let Err(e) = watchdog.await {
                            tracing::warn!(error = %e, "watchdog task failed");
                        }
                        JobEnd::Finished(joined)
                    }
                    Race::Watchdog(watched) => {
                        match watched {
                            Ok(outcome) => tracing::debug!(?outcome, "watchdog finished"),
                            Err(e) => tracing::error!(
                                job = %execution.name(),
                                error = %e,
                                "watchdog task failed, letting the job run to completion"
                            ),
                        }
                        self.await_job(&mut job_task, &execution).await
                    }
                    Race::Interrupted => {
                        if let Err(e) = watchdog.await {
                            tracing::warn!(error = %e, "watchdog task failed");
                        }
                        self.await_job(&mut job_task, &execution).await
                    }
                }
            }
        };

        let (job_result, interrupt_expired) = match end {
            JobEnd::Finished(Ok(result)) => (Some(result), false),
            JobEnd::Finished(Err(e)) => {
                tracing::error!(job = %execution.name(), error = %e, "job task failed");
                execution.console().println(format!("Job crashed: {e}"));
                (Some(BuildResult::Failure), false)
            }
            JobEnd::Abandoned => (None, true),
        };

        let result = execution
            .result_override()
            .or(job_result)
            .unwrap_or(BuildResult::Aborted);

        let timed_out = match (execution.latch().state(), &armed) {
            (LatchState::TimedOut, Some(armed)) => Some(TimeoutInfo {
                effective_ms: armed.effective().as_millis() as u64,
                strategy: armed.description().to_string(),
            }),
            _ => None,
        };

        let duration = started.elapsed();
        tracing::info!(
            job = %execution.name(),
            %result,
            timed_out = timed_out.is_some(),
            duration_ms = duration.as_millis() as u64,
            "execution finished"
        );

        ExecutionReport {
            job: execution.name().to_string(),
            result,
            timed_out,
            interrupted_manually: execution.interrupted_manually(),
            interrupt_expired,
            description: execution.description(),
            restart_limit: execution.restart_limit(),
            started_at,
            duration_ms: duration.as_millis() as u64,
            log: execution.console().lines(),
        }
    }

    /// Wait for the job. Unbounded until interruption is requested, then at
    /// most the grace period, cut short by a kill request.
    async fn await_job(
        &self,
        job_task: &mut JoinHandle<BuildResult>,
        execution: &Execution,
    ) -> JobEnd {
        if !execution.interrupt_requested() {
            tokio::select! {
                biased;
                joined = &mut *job_task => return JobEnd::Finished(joined),
                _ = execution.interrupt_token().cancelled() => {}
            }
        }

        let grace = tokio::time::sleep(self.options.interrupt_grace);
        tokio::select! {
            biased;
            joined = &mut *job_task => return JobEnd::Finished(joined),
            _ = execution.kill_token().cancelled() => {
                tracing::warn!(job = %execution.name(), "kill requested, abandoning job");
                execution.console().println("Job killed");
            }
            _ = grace => {
                tracing::warn!(
                    job = %execution.name(),
                    grace_secs = self.options.interrupt_grace.as_secs(),
                    "job did not stop after interruption, abandoning it"
                );
                execution.console().println(format!(
                    "Job did not stop within {} seconds of interruption",
                    self.options.interrupt_grace.as_secs()
                ));
            }
        }
        job_task.abort();
        JobEnd::Abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::FloorOverride;
    use crate::operations::{OperationError, OperationSpec, TimeoutOperation};
    use crate::shell::ShellJob;
    use crate::strategy::{DeadlineStrategy, ElapsedStrategy, NoActivityStrategy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Logs "polling" every `poll`, exits successfully after `exit`, and
    /// stops early when interrupted.
    struct PollingJob {
        poll: Duration,
        exit: Duration,
    }

    #[async_trait]
    impl Job for PollingJob {
        fn name(&self) -> &str {
            "polling"
        }

        async fn run(&mut self, ctx: JobContext) -> BuildResult {
            let start = Instant::now();
            let mut poll_at = start + self.poll;
            let exit_at = start + self.exit;
            ctx.console.println("----start----");
            loop {
                tokio::select! {
                    _ = ctx.interrupt.cancelled() => {
                        ctx.console.println("----interrupted----");
                        return BuildResult::Aborted;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                let now = Instant::now();
                if poll_at < now {
                    ctx.console.println("----polling----");
                    poll_at += self.poll;
                }
                if exit_at < now {
                    ctx.console.println("----exit----");
                    return BuildResult::Success;
                }
            }
        }
    }

    /// Silent for `duration`, ignores interruption.
    struct SleepJob {
        duration: Duration,
        result: BuildResult,
    }

    #[async_trait]
    impl Job for SleepJob {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn run(&mut self, _ctx: JobContext) -> BuildResult {
            tokio::time::sleep(self.duration).await;
            self.result
        }
    }

    struct PanicJob;

    #[async_trait]
    impl Job for PanicJob {
        fn name(&self) -> &str {
            "panic"
        }

        async fn run(&mut self, _ctx: JobContext) -> BuildResult {
            panic!("job exploded");
        }
    }

    struct CountOperation {
        count: AtomicUsize,
    }

    impl TimeoutOperation for CountOperation {
        fn name(&self) -> &str {
            "count"
        }

        fn perform(
            &self,
            execution: &Execution,
            _effective: Duration,
        ) -> Result<(), OperationError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            execution.console().println(format!("Count: {n}"));
            Ok(())
        }
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(SupervisorOptions {
            poll_interval: Duration::from_millis(250),
            interrupt_grace: Duration::from_secs(30),
            minimum_timeout: Duration::ZERO,
        })
    }

    fn polling(poll_secs: u64, exit_secs: u64) -> Box<dyn Job> {
        Box::new(PollingJob {
            poll: Duration::from_secs(poll_secs),
            exit: Duration::from_secs(exit_secs),
        })
    }

    fn no_activity(expr: &str) -> TimeoutStrategy {
        TimeoutStrategy::NoActivity(NoActivityStrategy::new(expr))
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_longer_than_timeout_fails_build() {
        let pipeline = Arc::new(OperationPipeline::legacy(true, false));
        let report = supervisor()
            .run(polling(10, 30), &no_activity("5"), pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Failure);
        let info = report.timed_out.expect("timed out");
        assert_eq!(info.effective_ms, 5_000);
        assert_eq!(info.strategy, "no activity for 5 seconds");
        assert!(report.duration_ms < 10_000);
        assert!(report.log.contains(&"----interrupted----".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_more_frequent_than_timeout_succeeds() {
        let pipeline = Arc::new(OperationPipeline::legacy(true, false));
        let report = supervisor()
            .run(polling(10, 30), &no_activity("15"), pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Success);
        assert!(report.timed_out.is_none());
        assert!(report.duration_ms >= 30_000);
        let polls = report
            .log
            .iter()
            .filter(|l| l.as_str() == "----polling----")
            .count();
        assert!(polls >= 2, "expected periodic activity, got {polls} polls");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_performed_only_once() {
        let count = Arc::new(CountOperation {
            count: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(OperationPipeline::new(vec![count.clone()]));
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(10),
            result: BuildResult::Success,
        });

        let report = supervisor()
            .run(job, &no_activity("3"), pipeline, Parameters::new())
            .await;

        assert_eq!(count.count.load(Ordering::SeqCst), 1);
        assert_eq!(report.result, BuildResult::Success);
        assert!(report.timed_out.is_some());
        assert!(report.duration_ms >= 10_000);
        assert_eq!(report.log, vec!["Count: 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameter_driven_timeout() {
        let strategy = no_activity("${TIMEOUT}");
        let params = |v: &str| Parameters::from([("TIMEOUT".to_string(), v.to_string())]);
        let pipeline = Arc::new(OperationPipeline::from_specs(&[OperationSpec::Abort]));

        let ok = supervisor()
            .run(polling(10, 30), &strategy, pipeline.clone(), params("15"))
            .await;
        assert_eq!(ok.result, BuildResult::Success);

        let aborted = supervisor()
            .run(polling(10, 30), &strategy, pipeline, params("5"))
            .await;
        assert_eq!(aborted.result, BuildResult::Aborted);
        assert_eq!(aborted.timed_out.unwrap().effective_ms, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_finishing_first_keeps_its_result() {
        let count = Arc::new(CountOperation {
            count: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(OperationPipeline::new(vec![count.clone()]));
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(2),
            result: BuildResult::Unstable,
        });
        let strategy = TimeoutStrategy::Elapsed(ElapsedStrategy::new("60"));

        let report = supervisor()
            .run(job, &strategy, pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Unstable);
        assert!(report.timed_out.is_none());
        assert_eq!(count.count.load(Ordering::SeqCst), 0);

        // Long after the deadline nothing fires.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_job_abandoned_after_grace() {
        let sup = Supervisor::new(SupervisorOptions {
            poll_interval: Duration::from_millis(250),
            interrupt_grace: Duration::from_secs(5),
            minimum_timeout: Duration::ZERO,
        });
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(3600),
            result: BuildResult::Success,
        });
        let strategy = TimeoutStrategy::Elapsed(ElapsedStrategy::new("10"));
        let pipeline = Arc::new(OperationPipeline::new(Vec::new()));

        let report = sup.run(job, &strategy, pipeline, Parameters::new()).await;

        assert_eq!(report.result, BuildResult::Aborted);
        assert!(report.interrupt_expired);
        assert!(report.timed_out.is_some());
        assert!(report.duration_ms >= 15_000 && report.duration_ms < 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_floor_applies_to_unresolved_expression() {
        let sup = Supervisor::new(SupervisorOptions {
            poll_interval: Duration::from_millis(250),
            interrupt_grace: Duration::from_secs(30),
            minimum_timeout: Duration::from_secs(4),
        });
        let pipeline = Arc::new(OperationPipeline::new(Vec::new()));
        let report = sup
            .run(polling(10, 30), &no_activity("${TEST}"), pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Aborted);
        assert_eq!(report.timed_out.unwrap().effective_ms, 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_strategy_lets_job_finish() {
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(5),
            result: BuildResult::Success,
        });
        let strategy = TimeoutStrategy::Deadline(DeadlineStrategy::new("not a time", 0));
        let pipeline = Arc::new(OperationPipeline::new(Vec::new()));

        let report = supervisor()
            .run(job, &strategy, pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Success);
        assert!(report.timed_out.is_none());
        assert!(report.log[0].starts_with("Timeout not armed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_interrupt_wins_over_timeout() {
        let count = Arc::new(CountOperation {
            count: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(OperationPipeline::new(vec![count.clone()]));
        let execution = Execution::new("polling");
        let interrupter = execution.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            interrupter.interrupt_manually();
        });

        let report = supervisor()
            .run_execution(
                execution,
                polling(10, 30),
                &no_activity("5"),
                pipeline,
                Parameters::new(),
            )
            .await;

        assert_eq!(report.result, BuildResult::Aborted);
        assert!(report.interrupted_manually);
        assert!(report.timed_out.is_none());
        assert_eq!(count.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_panic_reported_as_failure() {
        let pipeline = Arc::new(OperationPipeline::new(Vec::new()));
        let report = supervisor()
            .run(Box::new(PanicJob), &no_activity("60"), pipeline, Parameters::new())
            .await;
        assert_eq!(report.result, BuildResult::Failure);
        assert!(report.timed_out.is_none());
    }

    /// Fails, then panics when the pipeline names it in the failure
    /// message, which happens outside the per-operation panic isolation.
    struct UnnamedOperation;

    impl TimeoutOperation for UnnamedOperation {
        fn name(&self) -> &str {
            panic!("no name");
        }

        fn perform(
            &self,
            _execution: &Execution,
            _effective: Duration,
        ) -> Result<(), OperationError> {
            Err(OperationError::Failed {
                operation: "unnamed".to_string(),
                reason: "always".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_largest_literal_timeout_never_fires() {
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(3600),
            result: BuildResult::Success,
        });
        let strategy = TimeoutStrategy::Elapsed(ElapsedStrategy::new("18446744073709551615"));
        let pipeline = Arc::new(OperationPipeline::from_specs(&[OperationSpec::Abort]));

        let report = supervisor()
            .run(job, &strategy, pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Success);
        assert!(report.timed_out.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_panic_lets_job_finish() {
        let pipeline = Arc::new(OperationPipeline::new(vec![Arc::new(UnnamedOperation)]));
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(10),
            result: BuildResult::Success,
        });

        let report = supervisor()
            .run(job, &no_activity("3"), pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Success);
        assert!(report.timed_out.is_some());
        assert!(!report.interrupt_expired);
        assert!(report.duration_ms >= 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_request_skips_grace_period() {
        let execution = Execution::new("sleep");
        let signaller = execution.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            signaller.interrupt_manually();
            tokio::time::sleep(Duration::from_secs(2)).await;
            signaller.force_kill();
        });
        let job = Box::new(SleepJob {
            duration: Duration::from_secs(3600),
            result: BuildResult::Success,
        });
        let pipeline = Arc::new(OperationPipeline::new(Vec::new()));

        let report = supervisor()
            .run_execution(execution, job, &no_activity("60"), pipeline, Parameters::new())
            .await;

        assert_eq!(report.result, BuildResult::Aborted);
        assert!(report.interrupted_manually);
        assert!(report.interrupt_expired);
        assert!(report.duration_ms >= 4_000 && report.duration_ms < 5_000);
        assert!(report.log.contains(&"Job killed".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_stops_shell_job_with_background_child() {
        let sup = Supervisor::new(SupervisorOptions {
            poll_interval: Duration::from_millis(50),
            interrupt_grace: Duration::from_secs(3),
            minimum_timeout: Duration::ZERO,
        });
        let job = Box::new(ShellJob::new("background", "sleep 30 & echo started"));
        let strategy = TimeoutStrategy::Elapsed(ElapsedStrategy::new("1"));
        let pipeline = Arc::new(OperationPipeline::from_specs(&[OperationSpec::Abort]));

        let report = sup.run(job, &strategy, pipeline, Parameters::new()).await;

        assert_eq!(report.result, BuildResult::Aborted);
        assert!(report.timed_out.is_some());
        assert!(!report.interrupt_expired, "job should stop within the grace period");
        assert!(report.duration_ms < 3_000);
        assert!(report.log.contains(&"started".to_string()));
    }

    #[test]
    fn test_default_options_follow_process_floor() {
        let _floor = FloorOverride::set(Duration::from_secs(7));
        assert_eq!(
            SupervisorOptions::default().minimum_timeout,
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_report_record() {
        let report = ExecutionReport {
            job: "j".to_string(),
            result: BuildResult::Aborted,
            timed_out: Some(TimeoutInfo {
                effective_ms: 1000,
                strategy: "s".to_string(),
            }),
            interrupted_manually: false,
            interrupt_expired: false,
            description: None,
            restart_limit: None,
            started_at: Utc::now(),
            duration_ms: 1500,
            log: Vec::new(),
        };
        let record = report.record();
        assert!(record.timed_out);
        assert_eq!(record.duration_ms, 1500);
        assert_eq!(record.result, BuildResult::Aborted);
    }
}
