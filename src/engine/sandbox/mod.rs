mod docker;
mod exec;
mod isolate;
mod language;
mod piston;
mod pool;
mod process;
#[cfg(test)]
pub mod scripted;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{
    config::{EngineConfig, JudgingConfig, SandboxBackendKind},
    models::{Language, ProblemLimits},
};

pub use docker::DockerSandbox;
pub use isolate::IsolateSandbox;
pub use language::LanguageSpec;
pub use piston::PistonSandbox;
pub use pool::{SlotLease, SlotPool};
pub use process::ProcessSandbox;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub max_output_bytes: usize,
    pub max_processes: u64,
}

impl ExecutionLimits {
    pub fn for_run(problem: &ProblemLimits, judging: &JudgingConfig) -> Self {
        Self {
            wall_time_ms: problem.time_limit_ms(),
            memory_bytes: problem.memory_limit_bytes(),
            max_output_bytes: judging.max_output_bytes,
            max_processes: judging.max_processes,
        }
    }

    pub fn for_compile(judging: &JudgingConfig) -> Self {
        Self {
            wall_time_ms: judging.compile_timeout.as_millis() as u64,
            memory_bytes: judging.compile_memory_mb.saturating_mul(1024 * 1024),
            max_output_bytes: judging.max_output_bytes,
            max_processes: judging.max_processes,
        }
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_bytes / 1024
    }

    pub fn memory_mb(&self) -> u64 {
        (self.memory_bytes / (1024 * 1024)).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct SourceBundle {
    pub submission_id: Uuid,
    pub language: Language,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CompileReport {
    /// Text shown to the user for a failed build.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("compiler exited with code {}", self.exit_code)
    }
}

pub enum CompileOutcome {
    Ready(Artifact),
    Failed(CompileReport),
}

/// Scratch area owned by one submission. Dropping it removes the temporary
/// directory and hands the sandbox slot back to its pool.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    _dir: Option<TempDir>,
    slot: Option<SlotLease>,
}

impl Workspace {
    pub fn temp(prefix: &str) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            _dir: Some(dir),
            slot: None,
        })
    }

    pub fn slot(path: PathBuf, slot: SlotLease) -> Self {
        Self {
            path,
            _dir: None,
            slot: Some(slot),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_id(&self) -> Option<u32> {
        self.slot.as_ref().map(SlotLease::id)
    }
}

/// Everything `run` needs to execute one prepared submission.
#[derive(Debug)]
pub struct Artifact {
    pub submission_id: Uuid,
    pub language: Language,
    pub spec: LanguageSpec,
    pub source: String,
    pub workspace: Option<Workspace>,
}

impl Artifact {
    pub fn new(bundle: &SourceBundle, workspace: Option<Workspace>) -> Self {
        Self {
            submission_id: bundle.submission_id,
            language: bundle.language,
            spec: LanguageSpec::for_language(&bundle.language),
            source: bundle.code.clone(),
            workspace,
        }
    }

    pub fn workspace(&self) -> anyhow::Result<&Workspace> {
        self.workspace
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("artifact has no local workspace"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTelemetry {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub peak_memory_kb: Option<u64>,
    pub timed_out: bool,
    pub signaled: bool,
    pub oom_killed: bool,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The build failed inside a backend that compiles and runs in one call.
    #[error("{0}")]
    Compilation(String),
    #[error("sandbox call exceeded {0} ms")]
    Timeout(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether several `run` calls may share one artifact at the same time.
    fn supports_parallel_runs(&self) -> bool {
        false
    }

    /// Fixed per-call overhead on top of the case time limit, such as
    /// container start-up or a remote compile step.
    fn startup_allowance(&self, _language: Language) -> Duration {
        Duration::ZERO
    }

    /// Fixed overhead of a build on top of the compile time limit, such as
    /// box setup or container start-up and removal.
    fn compile_allowance(&self, _language: Language) -> Duration {
        Duration::ZERO
    }

    /// Claims what a submission holds from its build to its release. Waiting
    /// here is queueing and does not count against the compile time limit.
    async fn reserve(&self) -> Result<Option<SlotLease>, SandboxError> {
        Ok(None)
    }

    async fn compile(
        &self,
        bundle: &SourceBundle,
        limits: &ExecutionLimits,
        slot: Option<SlotLease>,
    ) -> Result<CompileOutcome, SandboxError>;

    async fn run(
        &self,
        artifact: &Artifact,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<RunTelemetry, SandboxError>;

    async fn release(&self, artifact: Artifact) {
        drop(artifact);
    }
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
        let judging = &config.judging;
        match config.sandbox_backend {
            SandboxBackendKind::Piston => Ok(Arc::new(PistonSandbox::new(
                config.piston.clone(),
                judging.compile_timeout,
                judging.grace,
            )?)),
            SandboxBackendKind::Isolate => Ok(Arc::new(IsolateSandbox::new(
                config.isolate.clone(),
                judging.compile_timeout,
                judging.grace,
            ))),
            SandboxBackendKind::Docker => Ok(Arc::new(DockerSandbox::new(config.docker.clone()))),
            SandboxBackendKind::Process => {
                Ok(Arc::new(ProcessSandbox::new(config.process.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_diagnostic_prefers_stderr() {
        let report = CompileReport {
            exit_code: 1,
            stdout: "noise".into(),
            stderr: "main.c:3:1: error: expected ';'\n".into(),
        };
        assert_eq!(report.diagnostic(), "main.c:3:1: error: expected ';'");

        let silent = CompileReport {
            exit_code: 2,
            stdout: String::new(),
            stderr: " ".into(),
        };
        assert_eq!(silent.diagnostic(), "compiler exited with code 2");
    }

    #[test]
    fn run_limits_follow_the_problem() {
        let problem = ProblemLimits {
            time_limit_seconds: 2.0,
            memory_limit_mb: 256,
            language: None,
        };
        let limits = ExecutionLimits::for_run(&problem, &JudgingConfig::default());
        assert_eq!(limits.wall_time_ms, 2000);
        assert_eq!(limits.memory_kb(), 262_144);
        assert_eq!(limits.memory_mb(), 256);
    }

    #[test]
    fn temp_workspace_is_removed_on_drop() {
        let workspace = Workspace::temp("judge-test-").unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.exists());
        drop(workspace);
        assert!(!path.exists());
    }
}
