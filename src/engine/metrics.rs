use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::models::{RunState, Verdict};

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    started_total: AtomicU64,
    completed_total: AtomicU64,
    aborted_total: AtomicU64,
    cases_total: AtomicU64,
    backend_errors_total: AtomicU64,
    verdicts: [AtomicU64; Verdict::ALL.len()],
    queue_depth: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) {
        self.started_total.fetch_add(1, Ordering::Relaxed);
        self.decrement_queue_depth();
    }

    /// Records the end of one judging run.
    pub fn finished(&self, state: RunState, verdict: Verdict, cases: usize, backend_errors: usize) {
        match state {
            RunState::Aborted => self.aborted_total.fetch_add(1, Ordering::Relaxed),
            _ => self.completed_total.fetch_add(1, Ordering::Relaxed),
        };
        self.verdicts[verdict.code() as usize].fetch_add(1, Ordering::Relaxed);
        self.cases_total.fetch_add(cases as u64, Ordering::Relaxed);
        self.backend_errors_total
            .fetch_add(backend_errors as u64, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = format!(
            concat!(
                "# TYPE judge_submitted_total counter\n",
                "judge_submitted_total {}\n",
                "# TYPE judge_started_total counter\n",
                "judge_started_total {}\n",
                "# TYPE judge_completed_total counter\n",
                "judge_completed_total {}\n",
                "# TYPE judge_aborted_total counter\n",
                "judge_aborted_total {}\n",
                "# TYPE judge_cases_total counter\n",
                "judge_cases_total {}\n",
                "# TYPE judge_backend_errors_total counter\n",
                "judge_backend_errors_total {}\n",
                "# TYPE judge_queue_depth gauge\n",
                "judge_queue_depth {}\n",
                "# TYPE judge_verdicts_total counter\n",
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.started_total.load(Ordering::Relaxed),
            self.completed_total.load(Ordering::Relaxed),
            self.aborted_total.load(Ordering::Relaxed),
            self.cases_total.load(Ordering::Relaxed),
            self.backend_errors_total.load(Ordering::Relaxed),
            self.queue_depth.load(Ordering::Relaxed),
        );
        for verdict in Verdict::ALL {
            out.push_str(&format!(
                "judge_verdicts_total{{verdict=\"{}\"}} {}\n",
                verdict.label(),
                self.verdicts[verdict.code() as usize].load(Ordering::Relaxed)
            ));
        }
        out
    }

    fn decrement_queue_depth(&self) {
        let mut current = self.queue_depth.load(Ordering::Relaxed);
        while current > 0 {
            match self.queue_depth.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_does_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.started();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("judge_queue_depth 0"));
    }

    #[test]
    fn verdicts_are_counted_by_label() {
        let metrics = MetricsRegistry::new();
        metrics.submitted();
        metrics.started();
        metrics.finished(RunState::Completed, Verdict::Accepted, 3, 0);
        metrics.finished(RunState::Aborted, Verdict::InternalError, 0, 0);
        metrics.finished(RunState::Completed, Verdict::RuntimeError, 2, 1);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("judge_completed_total 2"));
        assert!(rendered.contains("judge_aborted_total 1"));
        assert!(rendered.contains("judge_cases_total 5"));
        assert!(rendered.contains("judge_backend_errors_total 1"));
        let accepted = format!("verdict=\"{}\"}} 1", Verdict::Accepted.label());
        assert!(rendered.contains(&accepted));
    }
}
