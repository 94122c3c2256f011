use std::sync::Arc;

use tokio::sync::{Mutex, mpsc::Receiver};

use crate::engine::{metrics::MetricsRegistry, orchestrator::Judge, queue::QueuedJob};

pub fn spawn_worker_pool(
    workers: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    judge: Arc<Judge>,
    metrics: Arc<MetricsRegistry>,
) {
    for worker_id in 0..workers.max(1) {
        let receiver = receiver.clone();
        let judge = judge.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, judge, metrics).await;
        });
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    judge: Arc<Judge>,
    metrics: Arc<MetricsRegistry>,
) {
    loop {
        let job = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(job) = job else {
            tracing::info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        let submission_id = job.submission_id;
        tracing::info!(worker_id, %submission_id, problem_id = %job.problem_id, "worker claimed submission");
        metrics.started();

        let report = judge.clone().judge_guarded(job).await;
        metrics.finished(report.state, report.status, report.cases_run, report.backend_errors);
        tracing::info!(worker_id, %submission_id, verdict = %report.status, "worker released submission");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::engine::{
        config::JudgingConfig,
        models::{Language, Problem, RunState, SubmissionRecord, TestCase, Verdict},
        queue::Scheduler,
        sandbox::scripted::ScriptedSandbox,
        store::MemoryStore,
    };

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let metrics = Arc::new(MetricsRegistry::new());
        let store = MemoryStore::new(None);
        store.insert_problem(Problem {
            id: "echo".into(),
            time_limit: Some(1.0),
            memory_limit: Some(64),
            language: Some(Language::Python),
            test_cases: vec![TestCase {
                input: "hi".into(),
                output: "hi".into(),
            }],
        });
        let judge = Arc::new(Judge::new(
            Arc::new(store.clone()),
            Arc::new(ScriptedSandbox::new()),
            JudgingConfig::default(),
        ));
        let scheduler = Scheduler::new(16, metrics.clone());
        spawn_worker_pool(2, scheduler.receiver(), judge, metrics.clone());

        let ids = (0..4).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
        for id in &ids {
            store.insert(SubmissionRecord::pending(
                *id,
                "u".into(),
                "echo".into(),
                "print(input())".into(),
                None,
                "public".into(),
            ));
            scheduler
                .submit(QueuedJob {
                    submission_id: *id,
                    problem_id: "echo".into(),
                    language: None,
                    code: "print(input())".into(),
                })
                .unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ids
            .iter()
            .any(|id| !store.get(id).is_some_and(|r| r.state.is_terminal()))
        {
            assert!(tokio::time::Instant::now() < deadline, "workers did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for id in &ids {
            let record = store.get(id).unwrap();
            assert_eq!(record.state, RunState::Completed);
            assert_eq!(record.status, Verdict::Accepted);
        }
        assert_eq!(metrics.queue_depth(), 0);
    }
}
