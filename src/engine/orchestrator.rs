use std::{any::Any, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::engine::{
    compare::Comparator,
    config::JudgingConfig,
    error::JudgeError,
    models::{Language, RunState, SubmissionUpdate, Verdict},
    queue::QueuedJob,
    runner::{CaseRunner, ProgressSink},
    sandbox::{CompileOutcome, ExecutionLimits, SandboxBackend, SourceBundle},
    store::{StoreError, SubmissionStore},
    verdict::{VerdictAggregator, VerdictSummary},
};

/// How a judging run ended, for logs and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeReport {
    pub submission_id: Uuid,
    pub state: RunState,
    pub status: Verdict,
    pub cases_run: usize,
    pub backend_errors: usize,
}

impl JudgeReport {
    fn aborted(submission_id: Uuid) -> Self {
        Self {
            submission_id,
            state: RunState::Aborted,
            status: Verdict::InternalError,
            cases_run: 0,
            backend_errors: 0,
        }
    }
}

/// Drives one submission from `Created` to `Completed` or `Aborted`.
pub struct Judge {
    store: Arc<dyn SubmissionStore>,
    backend: Arc<dyn SandboxBackend>,
    runner: CaseRunner,
    aggregator: VerdictAggregator,
    judging: JudgingConfig,
}

struct StoreProgress {
    store: Arc<dyn SubmissionStore>,
    submission_id: Uuid,
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn report(&self, cases_done: usize, cases_total: usize) -> anyhow::Result<()> {
        self.store
            .update_submission(self.submission_id, SubmissionUpdate::progress(cases_done, cases_total))
            .await?;
        Ok(())
    }
}

impl Judge {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        backend: Arc<dyn SandboxBackend>,
        judging: JudgingConfig,
    ) -> Self {
        let runner = CaseRunner::new(
            backend.clone(),
            Comparator::new(judging.compare_policy),
            judging.grace,
            judging.case_concurrency,
        );
        Self {
            store,
            backend,
            runner,
            aggregator: VerdictAggregator::new(judging.unknown_memory),
            judging,
        }
    }

    /// Judges on a separate task so that a panic anywhere in judging still
    /// leaves the submission in a terminal state.
    pub async fn judge_guarded(self: Arc<Self>, job: QueuedJob) -> JudgeReport {
        let submission_id = job.submission_id;
        let judge = self.clone();
        match tokio::spawn(async move { judge.judge(&job).await }).await {
            Ok(report) => report,
            Err(err) => {
                let message = if err.is_panic() {
                    format!("judging task panicked: {}", panic_message(err.into_panic()))
                } else {
                    format!("judging task was cancelled: {err}")
                };
                tracing::error!(%submission_id, error = %message, "judging task died");
                self.abort(submission_id, message).await
            }
        }
    }

    pub async fn judge(&self, job: &QueuedJob) -> JudgeReport {
        tracing::info!(
            submission_id = %job.submission_id,
            problem_id = %job.problem_id,
            backend = self.backend.name(),
            "judging submission"
        );
        let report = match self.try_judge(job).await {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(submission_id = %job.submission_id, error = %err, "judging aborted");
                self.abort(job.submission_id, err.to_string()).await
            }
        };
        tracing::info!(
            submission_id = %report.submission_id,
            verdict = %report.status,
            state = ?report.state,
            cases = report.cases_run,
            "judging finished"
        );
        report
    }

    async fn try_judge(&self, job: &QueuedJob) -> Result<JudgeReport, JudgeError> {
        let id = job.submission_id;
        let limits = self
            .store
            .problem_limits(&job.problem_id)
            .await
            .map_err(config_error)?;
        let cases = self
            .store
            .test_cases(&job.problem_id)
            .await
            .map_err(config_error)?;
        if cases.is_empty() {
            return Err(JudgeError::Config(format!(
                "problem {} has no test cases",
                job.problem_id
            )));
        }
        let language = resolve_language(job.language, limits.language).ok_or_else(|| {
            JudgeError::Config(format!("no language for problem {}", job.problem_id))
        })?;

        self.store
            .update_submission(id, SubmissionUpdate::running(cases.len()))
            .await?;

        let bundle = SourceBundle {
            submission_id: id,
            language,
            code: job.code.clone(),
        };
        // Waiting for a sandbox slot is queueing, so it sits outside the bound.
        let slot = self.backend.reserve().await?;
        let compile_limits = ExecutionLimits::for_compile(&self.judging);
        let compile_bound = self.judging.compile_timeout
            + self.judging.grace
            + self.backend.compile_allowance(language);
        let compiled = match tokio::time::timeout(
            compile_bound,
            self.backend.compile(&bundle, &compile_limits, slot),
        )
        .await
        {
            Ok(compiled) => compiled,
            Err(_) => {
                let bound_ms = compile_bound.as_millis() as u64;
                tracing::warn!(submission_id = %id, bound_ms, "compile step overran its bound");
                return self
                    .finish_compile_failure(id, format!("compilation exceeded {bound_ms} ms"))
                    .await;
            }
        };

        let artifact = match compiled.map_err(JudgeError::from) {
            Ok(CompileOutcome::Ready(artifact)) => Arc::new(artifact),
            Ok(CompileOutcome::Failed(report)) => {
                return self.finish_compile_failure(id, report.diagnostic()).await;
            }
            Err(JudgeError::Compilation(diagnostic)) => {
                return self.finish_compile_failure(id, diagnostic).await;
            }
            Err(err) => return Err(err),
        };

        let run_limits = ExecutionLimits::for_run(&limits, &self.judging);
        let progress = StoreProgress {
            store: self.store.clone(),
            submission_id: id,
        };
        let result = self
            .runner
            .run_all(artifact.clone(), &cases, &run_limits, &progress)
            .await;

        match Arc::try_unwrap(artifact) {
            Ok(artifact) => self.backend.release(artifact).await,
            Err(_) => tracing::debug!(submission_id = %id, "artifact still shared, dropping without release"),
        }

        let result = match result {
            Ok(result) => result,
            Err(JudgeError::Compilation(diagnostic)) => {
                return self.finish_compile_failure(id, diagnostic).await;
            }
            Err(err) => return Err(err),
        };

        let summary = self.aggregator.aggregate(&result.outcomes, &limits);
        if summary.memory_unknown {
            tracing::warn!(
                submission_id = %id,
                backend = self.backend.name(),
                policy = ?self.judging.unknown_memory,
                "peak memory unknown for some cases"
            );
        }
        let backend_errors = result.outcomes.iter().filter(|o| o.is_backend_error).count();
        let cases_run = result.outcomes.len();
        let update = final_update(&summary, result.stdout_list(), result.stderr_list());
        self.write_final(id, update).await;

        Ok(JudgeReport {
            submission_id: id,
            state: RunState::Completed,
            status: summary.status,
            cases_run,
            backend_errors,
        })
    }

    async fn finish_compile_failure(&self, id: Uuid, diagnostic: String) -> Result<JudgeReport, JudgeError> {
        tracing::info!(submission_id = %id, "compilation failed");
        let summary = self.aggregator.compilation_failed();
        let update = final_update(&summary, Vec::new(), vec![diagnostic]);
        self.write_final(id, update).await;
        Ok(JudgeReport {
            submission_id: id,
            state: RunState::Completed,
            status: summary.status,
            cases_run: 0,
            backend_errors: 0,
        })
    }

    async fn abort(&self, id: Uuid, message: String) -> JudgeReport {
        self.write_final(id, SubmissionUpdate::aborted(message)).await;
        JudgeReport::aborted(id)
    }

    /// Terminal writes get one retry.
    async fn write_final(&self, id: Uuid, update: SubmissionUpdate) {
        let first = match self.store.update_submission(id, update.clone()).await {
            Ok(()) => return,
            Err(err) => err,
        };
        tracing::warn!(submission_id = %id, error = %first, "final verdict write failed, retrying");
        if let Err(err) = self.store.update_submission(id, update.clone()).await {
            tracing::error!(
                submission_id = %id,
                error = %err,
                first_error = %first,
                state = ?update.state,
                status = ?update.status,
                stdout_list = ?update.stdout_list,
                stderr_list = ?update.stderr_list,
                time_ms = ?update.time_ms,
                memory_kb = ?update.memory_kb,
                "final verdict could not be stored"
            );
        }
    }
}

fn final_update(summary: &VerdictSummary, stdout_list: Vec<String>, stderr_list: Vec<String>) -> SubmissionUpdate {
    SubmissionUpdate {
        state: Some(RunState::Completed),
        status: Some(summary.status),
        stdout_list: Some(stdout_list),
        stderr_list: Some(stderr_list),
        time_ms: Some(summary.time_ms),
        memory_kb: Some(summary.memory_kb),
        passed_all: Some(summary.passed_all),
        passed_time_limit: Some(summary.passed_time_limit),
        passed_memory_limit: Some(summary.passed_memory_limit),
        finished_at: Some(Utc::now()),
        ..SubmissionUpdate::default()
    }
}

fn config_error(err: StoreError) -> JudgeError {
    match err {
        StoreError::NotFound(what) => JudgeError::Config(format!("{what} not found")),
        other => JudgeError::Persistence(other),
    }
}

fn resolve_language(submitted: Option<Language>, problem: Option<Language>) -> Option<Language> {
    submitted.or(problem)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
