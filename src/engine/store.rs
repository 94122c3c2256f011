use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::engine::models::{Problem, ProblemLimits, SubmissionRecord, SubmissionUpdate, TestCase};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("journal write failed: {0}")]
    Io(String),
    #[error("record could not be encoded: {0}")]
    Encode(String),
}

/// Where problems are read from and submission rows are written to. The
/// engine is the only writer of a submission row once it is queued.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn problem_limits(&self, problem_id: &str) -> Result<ProblemLimits, StoreError>;

    async fn test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, StoreError>;

    async fn update_submission(&self, id: Uuid, update: SubmissionUpdate) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct MemoryStore {
    submissions: Arc<DashMap<Uuid, SubmissionRecord>>,
    problems: Arc<DashMap<String, Problem>>,
    default_time_limit_secs: f64,
    default_memory_limit_mb: u64,
    persistence_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            submissions: Arc::new(DashMap::new()),
            problems: Arc::new(DashMap::new()),
            default_time_limit_secs: 20.0,
            default_memory_limit_mb: 128,
            persistence_path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_default_limits(mut self, time_limit_secs: f64, memory_limit_mb: u64) -> Self {
        self.default_time_limit_secs = time_limit_secs;
        self.default_memory_limit_mb = memory_limit_mb;
        self
    }

    /// Loads a JSON array of problems. Returns how many were loaded.
    pub async fn load_catalog(&self, path: &Path) -> anyhow::Result<usize> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read problem catalog {}", path.display()))?;
        let problems: Vec<Problem> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid problem catalog {}", path.display()))?;
        let count = problems.len();
        for problem in problems {
            self.insert_problem(problem);
        }
        Ok(count)
    }

    pub fn insert_problem(&self, problem: Problem) {
        self.problems.insert(problem.id.clone(), problem);
    }

    pub fn insert(&self, record: SubmissionRecord) {
        self.submissions.insert(record.id, record);
    }

    pub fn get(&self, id: &Uuid) -> Option<SubmissionRecord> {
        self.submissions.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    pub fn remove(&self, id: &Uuid) -> Option<SubmissionRecord> {
        self.submissions.remove(id).map(|(_, record)| record)
    }

    async fn append_journal(&self, path: &Path, record: &SubmissionRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record).map_err(|e| StoreError::Encode(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn problem_limits(&self, problem_id: &str) -> Result<ProblemLimits, StoreError> {
        let problem = self
            .problems
            .get(problem_id)
            .ok_or_else(|| StoreError::NotFound(format!("problem {problem_id}")))?;
        Ok(ProblemLimits {
            time_limit_seconds: problem
                .time_limit
                .filter(|secs| *secs > 0.0)
                .unwrap_or(self.default_time_limit_secs),
            memory_limit_mb: problem
                .memory_limit
                .filter(|mb| *mb > 0)
                .unwrap_or(self.default_memory_limit_mb),
            language: problem.language,
        })
    }

    async fn test_cases(&self, problem_id: &str) -> Result<Vec<TestCase>, StoreError> {
        self.problems
            .get(problem_id)
            .map(|problem| problem.test_cases.clone())
            .ok_or_else(|| StoreError::NotFound(format!("problem {problem_id}")))
    }

    async fn update_submission(&self, id: Uuid, update: SubmissionUpdate) -> Result<(), StoreError> {
        let terminal = update.is_terminal();
        let snapshot = {
            let mut entry = self
                .submissions
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("submission {id}")))?;
            entry.apply(update);
            terminal.then(|| entry.clone())
        };

        if let (Some(path), Some(record)) = (&self.persistence_path, snapshot) {
            self.append_journal(path, &record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::{Language, RunState, Verdict};

    fn problem(id: &str) -> Problem {
        Problem {
            id: id.into(),
            time_limit: None,
            memory_limit: Some(256),
            language: Some(Language::Cpp),
            test_cases: vec![TestCase {
                input: "1 2".into(),
                output: "3".into(),
            }],
        }
    }

    fn pending(id: Uuid) -> SubmissionRecord {
        SubmissionRecord::pending(id, "u1".into(), "p1".into(), "code".into(), None, "public".into())
    }

    #[tokio::test]
    async fn missing_limits_fall_back_to_defaults() {
        let store = MemoryStore::new(None).with_default_limits(5.0, 64);
        store.insert_problem(problem("p1"));

        let limits = store.problem_limits("p1").await.unwrap();
        assert_eq!(limits.time_limit_seconds, 5.0);
        assert_eq!(limits.memory_limit_mb, 256);
        assert_eq!(limits.language, Some(Language::Cpp));
        assert_eq!(store.test_cases("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = MemoryStore::new(None);
        assert!(matches!(
            store.problem_limits("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store
                .update_submission(Uuid::new_v4(), SubmissionUpdate::progress(1, 2))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_terminal_updates_reach_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("results.jsonl");
        let store = MemoryStore::new(Some(journal.clone()));
        let id = Uuid::new_v4();
        store.insert(pending(id));

        store.update_submission(id, SubmissionUpdate::running(2)).await.unwrap();
        store.update_submission(id, SubmissionUpdate::progress(1, 2)).await.unwrap();
        assert!(!journal.exists());

        store
            .update_submission(id, SubmissionUpdate::aborted("sandbox unavailable".into()))
            .await
            .unwrap();
        let raw = std::fs::read_to_string(&journal).unwrap();
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1);
        let record: SubmissionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record.state, RunState::Aborted);
        assert_eq!(record.status, Verdict::InternalError);
        assert_eq!(record.cases_done, 1);
    }

    #[tokio::test]
    async fn unwritable_journal_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(Some(dir.path().join("missing").join("results.jsonl")));
        let id = Uuid::new_v4();
        store.insert(pending(id));
        let err = store
            .update_submission(id, SubmissionUpdate::aborted("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        // The in-memory row is still updated.
        assert_eq!(store.get(&id).unwrap().state, RunState::Aborted);
    }

    #[tokio::test]
    async fn loads_a_problem_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("problems.json");
        std::fs::write(
            &path,
            r#"[{"id":"sum","time_limit":1,"memory_limit":64,"language":"python",
                "test_cases":[{"input":"1 2\n","output":"3\n"}]},
               {"id":"empty"}]"#,
        )
        .unwrap();
        let store = MemoryStore::new(None);
        assert_eq!(store.load_catalog(&path).await.unwrap(), 2);
        assert_eq!(store.test_cases("sum").await.unwrap().len(), 1);
        assert!(store.test_cases("empty").await.unwrap().is_empty());
        assert_eq!(
            store.problem_limits("sum").await.unwrap().language,
            Some(Language::Python)
        );
    }
}
