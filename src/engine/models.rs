use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    #[serde(alias = "c++")]
    Cpp,
    #[serde(alias = "python3")]
    Python,
    #[serde(alias = "js", alias = "node")]
    JavaScript,
    Java,
    Go,
    Rust,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final judgement of a submission. The numeric codes are the storage and
/// wire representation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Verdict {
    Pending = 0,
    Accepted = 1,
    WrongAnswer = 2,
    TimeLimitExceeded = 3,
    MemoryLimitExceeded = 4,
    RuntimeError = 5,
    CompilationError = 6,
    InternalError = 7,
}

impl Verdict {
    pub const ALL: [Verdict; 8] = [
        Verdict::Pending,
        Verdict::Accepted,
        Verdict::WrongAnswer,
        Verdict::TimeLimitExceeded,
        Verdict::MemoryLimitExceeded,
        Verdict::RuntimeError,
        Verdict::CompilationError,
        Verdict::InternalError,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pending => "pending",
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::RuntimeError => "runtime_error",
            Verdict::CompilationError => "compilation_error",
            Verdict::InternalError => "internal_error",
        }
    }
}

impl From<Verdict> for u8 {
    fn from(value: Verdict) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for Verdict {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Verdict::ALL
            .into_iter()
            .find(|verdict| verdict.code() == value)
            .ok_or_else(|| format!("unknown status code: {value}"))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Completed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemLimits {
    pub time_limit_seconds: f64,
    pub memory_limit_mb: u64,
    pub language: Option<Language>,
}

impl ProblemLimits {
    pub fn time_limit_ms(&self) -> u64 {
        (self.time_limit_seconds * 1000.0).round().max(1.0) as u64
    }

    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
}

/// Catalog entry. Unset limits fall back to the engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    pub id: String,
    #[serde(default)]
    pub time_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub problem_id: String,
    pub code: String,
    pub language: Option<Language>,
    pub visibility: String,
    pub status: Verdict,
    pub state: RunState,
    pub cases_done: usize,
    pub cases_total: usize,
    pub stdout_list: Vec<String>,
    pub stderr_list: Vec<String>,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub passed_all: bool,
    pub passed_time_limit: bool,
    pub passed_memory_limit: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SubmissionRecord {
    pub fn pending(
        id: Uuid,
        user_id: String,
        problem_id: String,
        code: String,
        language: Option<Language>,
        visibility: String,
    ) -> Self {
        Self {
            id,
            user_id,
            problem_id,
            code,
            language,
            visibility,
            status: Verdict::Pending,
            state: RunState::Created,
            cases_done: 0,
            cases_total: 0,
            stdout_list: Vec::new(),
            stderr_list: Vec::new(),
            time_ms: 0,
            memory_kb: 0,
            passed_all: false,
            passed_time_limit: false,
            passed_memory_limit: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn apply(&mut self, update: SubmissionUpdate) {
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(total) = update.cases_total {
            self.cases_total = total;
        }
        if let Some(done) = update.cases_done {
            self.cases_done = self.cases_done.max(done);
        }
        if let Some(stdout_list) = update.stdout_list {
            self.stdout_list = stdout_list;
        }
        if let Some(stderr_list) = update.stderr_list {
            self.stderr_list = stderr_list;
        }
        if let Some(time_ms) = update.time_ms {
            self.time_ms = time_ms;
        }
        if let Some(memory_kb) = update.memory_kb {
            self.memory_kb = memory_kb;
        }
        if let Some(passed_all) = update.passed_all {
            self.passed_all = passed_all;
        }
        if let Some(passed) = update.passed_time_limit {
            self.passed_time_limit = passed;
        }
        if let Some(passed) = update.passed_memory_limit {
            self.passed_memory_limit = passed;
        }
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.finished_at {
            self.finished_at = Some(at);
        }
    }
}

/// Field-level partial update of a submission row. Applying the same update
/// twice leaves the row unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionUpdate {
    pub state: Option<RunState>,
    pub status: Option<Verdict>,
    pub cases_done: Option<usize>,
    pub cases_total: Option<usize>,
    pub stdout_list: Option<Vec<String>>,
    pub stderr_list: Option<Vec<String>>,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub passed_all: Option<bool>,
    pub passed_time_limit: Option<bool>,
    pub passed_memory_limit: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SubmissionUpdate {
    pub fn progress(cases_done: usize, cases_total: usize) -> Self {
        Self {
            cases_done: Some(cases_done),
            cases_total: Some(cases_total),
            ..Self::default()
        }
    }

    pub fn running(cases_total: usize) -> Self {
        Self {
            state: Some(RunState::Running),
            cases_done: Some(0),
            cases_total: Some(cases_total),
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn aborted(message: String) -> Self {
        Self {
            state: Some(RunState::Aborted),
            status: Some(Verdict::InternalError),
            stdout_list: Some(Vec::new()),
            stderr_list: Some(vec![message]),
            passed_all: Some(false),
            finished_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(RunState::is_terminal)
    }
}

/// Result of running one test case, before aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub elapsed_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    pub is_correct: bool,
    pub is_timeout: bool,
    pub is_memory_exceeded: bool,
    pub is_backend_error: bool,
}

impl CaseOutcome {
    pub fn backend_error(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            elapsed_ms: None,
            peak_memory_kb: None,
            is_correct: false,
            is_timeout: false,
            is_memory_exceeded: false,
            is_backend_error: true,
        }
    }

    pub fn timeout(message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            elapsed_ms: Some(elapsed_ms),
            peak_memory_kb: None,
            is_correct: false,
            is_timeout: true,
            is_memory_exceeded: false,
            is_backend_error: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub outcomes: Vec<CaseOutcome>,
}

impl RunResult {
    pub fn stdout_list(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.stdout.clone()).collect()
    }

    pub fn stderr_list(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.stderr.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub user_id: String,
    pub problem_id: String,
    pub code: String,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default = "default_visibility")]
    pub visibility: String,
}

fn default_visibility() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmissionResponse {
    pub pending_id: Uuid,
    pub status: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub id: Uuid,
    pub status: Verdict,
    pub state: RunState,
    pub cases_done: usize,
    pub cases_total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_serializes_as_numeric_code() {
        let json = serde_json::to_string(&Verdict::TimeLimitExceeded).unwrap();
        assert_eq!(json, "3");
        let parsed: Verdict = serde_json::from_str("6").unwrap();
        assert_eq!(parsed, Verdict::CompilationError);
        assert!(serde_json::from_str::<Verdict>("8").is_err());
    }

    #[test]
    fn progress_updates_never_move_backwards() {
        let mut record = SubmissionRecord::pending(
            Uuid::new_v4(),
            "u1".into(),
            "p1".into(),
            "print(1)".into(),
            Some(Language::Python),
            "public".into(),
        );
        record.apply(SubmissionUpdate::progress(3, 5));
        record.apply(SubmissionUpdate::progress(2, 5));
        assert_eq!(record.cases_done, 3);
        assert_eq!(record.cases_total, 5);
    }

    #[test]
    fn submit_request_defaults_visibility_and_language() {
        let request: SubmitRequest = serde_json::from_str(
            r#"{"userId":"u","problemId":"42","code":"int main(){}"}"#,
        )
        .unwrap();
        assert_eq!(request.visibility, "public");
        assert!(request.language.is_none());
    }

    #[test]
    fn limits_convert_units() {
        let limits = ProblemLimits {
            time_limit_seconds: 1.5,
            memory_limit_mb: 128,
            language: None,
        };
        assert_eq!(limits.time_limit_ms(), 1500);
        assert_eq!(limits.memory_limit_kb(), 131_072);
        assert_eq!(limits.memory_limit_bytes(), 134_217_728);
    }

    #[test]
    fn language_aliases_deserialize() {
        let parse = |raw: &str| serde_json::from_str::<Language>(raw);
        assert_eq!(parse(r#""c++""#).unwrap(), Language::Cpp);
        assert_eq!(parse(r#""js""#).unwrap(), Language::JavaScript);
        assert_eq!(parse(r#""python3""#).unwrap(), Language::Python);
        assert!(parse(r#""cobol""#).is_err());
    }
}
