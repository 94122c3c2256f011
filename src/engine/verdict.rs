use std::str::FromStr;

use crate::engine::models::{CaseOutcome, ProblemLimits, Verdict};

/// What to conclude when a backend cannot report peak memory for a case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownMemoryPolicy {
    /// Trust the backend's own enforcement: unknown peaks do not fail the run.
    #[default]
    Pass,
    /// Refuse to accept without memory evidence.
    Fail,
}

impl FromStr for UnknownMemoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            _ => Err(format!("unsupported unknown-memory policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerdictSummary {
    pub status: Verdict,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub passed_all: bool,
    pub passed_time_limit: bool,
    pub passed_memory_limit: bool,
    pub memory_unknown: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerdictAggregator {
    unknown_memory: UnknownMemoryPolicy,
}

impl VerdictAggregator {
    pub fn new(unknown_memory: UnknownMemoryPolicy) -> Self {
        Self { unknown_memory }
    }

    /// Verdict for a run whose compile step failed. No case executed.
    pub fn compilation_failed(&self) -> VerdictSummary {
        VerdictSummary {
            status: Verdict::CompilationError,
            time_ms: 0,
            memory_kb: 0,
            passed_all: false,
            passed_time_limit: true,
            passed_memory_limit: true,
            memory_unknown: false,
        }
    }

    /// Reduces case outcomes to one verdict. The result does not depend on the
    /// order of `outcomes`.
    pub fn aggregate(&self, outcomes: &[CaseOutcome], limits: &ProblemLimits) -> VerdictSummary {
        let any_timeout = outcomes.iter().any(|o| o.is_timeout);
        let any_memory = outcomes.iter().any(|o| o.is_memory_exceeded);
        let any_runtime = outcomes.iter().any(|o| o.exit_code != 0 && !o.is_timeout);
        let any_incorrect = outcomes.iter().any(|o| !o.is_correct);
        let memory_unknown = outcomes
            .iter()
            .any(|o| o.peak_memory_kb.is_none() && !o.is_timeout && !o.is_backend_error);
        let strict_memory = self.unknown_memory == UnknownMemoryPolicy::Fail;

        let status = if any_timeout {
            Verdict::TimeLimitExceeded
        } else if any_memory {
            Verdict::MemoryLimitExceeded
        } else if any_runtime {
            Verdict::RuntimeError
        } else if strict_memory && memory_unknown {
            Verdict::InternalError
        } else if any_incorrect {
            Verdict::WrongAnswer
        } else if !outcomes.is_empty() {
            Verdict::Accepted
        } else {
            Verdict::InternalError
        };

        let time_ms = outcomes.iter().filter_map(|o| o.elapsed_ms).max().unwrap_or(0);
        let memory_kb = outcomes.iter().filter_map(|o| o.peak_memory_kb).max().unwrap_or(0);
        let passed_memory_limit = !any_memory
            && memory_kb < limits.memory_limit_kb()
            && !(strict_memory && memory_unknown);

        VerdictSummary {
            status,
            time_ms,
            memory_kb,
            passed_all: status == Verdict::Accepted,
            passed_time_limit: !any_timeout,
            passed_memory_limit,
            memory_unknown,
        }
    }
}
