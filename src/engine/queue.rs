use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender, error::TrySendError},
};
use uuid::Uuid;

use crate::engine::{error::EngineError, metrics::MetricsRegistry, models::Language};

/// Everything a worker needs to judge one submission.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub submission_id: Uuid,
    pub problem_id: String,
    pub language: Option<Language>,
    pub code: String,
}

#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            metrics,
        }
    }

    /// Enqueues without waiting; a full queue is reported to the caller.
    pub fn submit(&self, job: QueuedJob) -> Result<(), EngineError> {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.metrics.submitted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(EngineError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                Err(EngineError::Internal("job queue is closed".to_string()))
            }
        }
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> QueuedJob {
        QueuedJob {
            submission_id: Uuid::new_v4(),
            problem_id: "p1".into(),
            language: Some(Language::Python),
            code: "print(1)".into(),
        }
    }

    #[tokio::test]
    async fn full_queue_is_rejected() {
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(1, metrics.clone());
        scheduler.submit(job()).unwrap();
        assert!(matches!(scheduler.submit(job()), Err(EngineError::QueueFull)));
        assert_eq!(metrics.queue_depth(), 1);

        let received = scheduler.receiver().lock().await.recv().await;
        assert!(received.is_some());
        scheduler.submit(job()).unwrap();
    }
}
