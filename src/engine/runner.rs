use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::task::{AbortHandle, JoinSet};

use crate::engine::{
    compare::Comparator,
    error::JudgeError,
    models::{CaseOutcome, RunResult, TestCase},
    sandbox::{Artifact, ExecutionLimits, RunTelemetry, SandboxBackend},
};

/// Receives `{cases_done, cases_total}` after each finished case.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, cases_done: usize, cases_total: usize) -> anyhow::Result<()>;
}

/// Runs every test case of one prepared submission and collects outcomes in
/// test case order.
#[derive(Clone)]
pub struct CaseRunner {
    backend: Arc<dyn SandboxBackend>,
    comparator: Comparator,
    grace: Duration,
    concurrency: usize,
}

impl CaseRunner {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        comparator: Comparator,
        grace: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            backend,
            comparator,
            grace,
            concurrency: concurrency.max(1),
        }
    }

    /// Number of cases allowed in flight at once.
    pub fn width(&self) -> usize {
        if self.backend.supports_parallel_runs() {
            self.concurrency
        } else {
            1
        }
    }

    /// Only a build failure reported by a combined compile-and-run backend
    /// escapes as an error; everything else becomes a case outcome.
    pub async fn run_all(
        &self,
        artifact: Arc<Artifact>,
        cases: &[TestCase],
        limits: &ExecutionLimits,
        progress: &dyn ProgressSink,
    ) -> Result<RunResult, JudgeError> {
        let total = cases.len();
        let width = self.width();
        let bound = limits.wall_time() + self.grace + self.backend.startup_allowance(artifact.language);

        let mut slots: Vec<Option<CaseOutcome>> = vec![None; total];
        let mut in_flight = JoinSet::new();
        let mut next = 0;
        let mut done = 0;

        while done < total {
            while next < total && in_flight.len() < width {
                let task = CaseTask {
                    index: next,
                    backend: self.backend.clone(),
                    artifact: artifact.clone(),
                    case: cases[next].clone(),
                    limits: limits.clone(),
                    comparator: self.comparator,
                    bound,
                };
                in_flight.spawn(task.execute());
                next += 1;
            }

            let (index, outcome) = match in_flight.join_next().await {
                Some(Ok((index, Ok(outcome)))) => (index, outcome),
                Some(Ok((_, Err(err)))) => {
                    in_flight.abort_all();
                    return Err(err);
                }
                Some(Err(err)) => {
                    in_flight.abort_all();
                    return Err(JudgeError::Internal(format!("case task failed: {err}")));
                }
                None => break,
            };
            slots[index] = Some(outcome);
            done += 1;

            if let Err(err) = progress.report(done, total).await {
                tracing::warn!(
                    submission_id = %artifact.submission_id,
                    cases_done = done,
                    cases_total = total,
                    error = %err,
                    "progress update failed"
                );
            }
        }

        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| CaseOutcome::backend_error(format!("case {index} was not executed")))
            })
            .collect();
        Ok(RunResult { outcomes })
    }
}

/// Cancels the backend call when its case task goes away, whether it timed
/// out or the whole fan-out was abandoned.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct CaseTask {
    index: usize,
    backend: Arc<dyn SandboxBackend>,
    artifact: Arc<Artifact>,
    case: TestCase,
    limits: ExecutionLimits,
    comparator: Comparator,
    bound: Duration,
}

impl CaseTask {
    async fn execute(self) -> (usize, Result<CaseOutcome, JudgeError>) {
        let CaseTask {
            index,
            backend,
            artifact,
            case,
            limits,
            comparator,
            bound,
        } = self;
        let submission_id = artifact.submission_id;
        let backend_name = backend.name();
        let started = Instant::now();

        // A panicking backend call only takes this inner task down.
        let run_limits = limits.clone();
        let stdin = case.input.clone();
        let mut call = tokio::spawn(async move { backend.run(&artifact, &stdin, &run_limits).await });
        let _abort = AbortOnDrop(call.abort_handle());

        let result = match tokio::time::timeout(bound, &mut call).await {
            Err(_) => Err(JudgeError::Timeout(bound.as_millis() as u64)),
            Ok(Err(join_err)) => Err(JudgeError::Backend(format!("sandbox call failed: {join_err}"))),
            Ok(Ok(result)) => result.map_err(JudgeError::from),
        };

        let outcome = match result {
            Ok(telemetry) => classify(telemetry, &case, &limits, &comparator),
            Err(JudgeError::Compilation(diagnostic)) => {
                return (index, Err(JudgeError::Compilation(diagnostic)));
            }
            Err(JudgeError::Timeout(ms)) => {
                tracing::warn!(%submission_id, case = index, backend = backend_name, bound_ms = ms, "sandbox call overran its bound");
                CaseOutcome::timeout(
                    format!("execution exceeded {ms} ms"),
                    (started.elapsed().as_millis() as u64).max(limits.wall_time_ms),
                )
            }
            Err(err) => {
                tracing::warn!(%submission_id, case = index, backend = backend_name, error = %err, "case failed in sandbox");
                CaseOutcome::backend_error(err.to_string())
            }
        };

        tracing::debug!(
            %submission_id,
            case = index,
            correct = outcome.is_correct,
            timeout = outcome.is_timeout,
            exit_code = outcome.exit_code,
            "case finished"
        );
        (index, Ok(outcome))
    }
}

fn classify(
    telemetry: RunTelemetry,
    case: &TestCase,
    limits: &ExecutionLimits,
    comparator: &Comparator,
) -> CaseOutcome {
    let is_timeout = telemetry.timed_out || telemetry.elapsed_ms > limits.wall_time_ms;
    let is_memory_exceeded = telemetry.oom_killed
        || telemetry
            .peak_memory_kb
            .is_some_and(|kb| kb >= limits.memory_kb());
    let is_correct = comparator.compare(&telemetry.stdout, &case.output);
    CaseOutcome {
        is_correct,
        is_timeout,
        is_memory_exceeded,
        is_backend_error: false,
        exit_code: telemetry.exit_code,
        elapsed_ms: Some(telemetry.elapsed_ms),
        peak_memory_kb: telemetry.peak_memory_kb,
        stdout: telemetry.stdout,
        stderr: telemetry.stderr,
    }
}
