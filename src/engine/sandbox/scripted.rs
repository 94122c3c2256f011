//! In-memory backend for exercising the runner and orchestrator without a
//! real sandbox. By default every run echoes its stdin.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::engine::{
    models::Language,
    sandbox::{
        Artifact, CompileOutcome, CompileReport, ExecutionLimits, RunTelemetry, SandboxBackend,
        SandboxError, SlotLease, SlotPool, SourceBundle, Workspace,
    },
};

#[derive(Debug, Clone)]
pub enum Script {
    Reply(RunTelemetry),
    Fail(String),
    Compilation(String),
    Panic,
    Hang,
}

#[derive(Default)]
pub struct ScriptedSandbox {
    compile_failure: Option<CompileReport>,
    compile_error: Option<String>,
    scripts: HashMap<String, Script>,
    delay: Option<Duration>,
    compile_delay: Option<Duration>,
    compile_allowance: Duration,
    slots: Option<SlotPool>,
    parallel: bool,
    compiles: AtomicUsize,
    runs: AtomicUsize,
    releases: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen_limits: Mutex<Vec<ExecutionLimits>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_compile(mut self, stderr: &str) -> Self {
        self.compile_failure = Some(CompileReport {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
        self
    }

    pub fn compile_error(mut self, message: &str) -> Self {
        self.compile_error = Some(message.to_string());
        self
    }

    pub fn on_input(mut self, stdin: &str, script: Script) -> Self {
        self.scripts.insert(stdin.to_string(), script);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_compile_delay(mut self, delay: Duration) -> Self {
        self.compile_delay = Some(delay);
        self
    }

    pub fn with_compile_allowance(mut self, allowance: Duration) -> Self {
        self.compile_allowance = allowance;
        self
    }

    /// Each submission holds one slot of `pool` from build to release.
    pub fn with_slots(mut self, pool: SlotPool) -> Self {
        self.slots = Some(pool);
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen_limits(&self) -> Vec<ExecutionLimits> {
        self.seen_limits.lock().unwrap().clone()
    }

    pub fn echo(stdout: &str) -> RunTelemetry {
        RunTelemetry {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            elapsed_ms: 10,
            peak_memory_kb: Some(1024),
            timed_out: false,
            signaled: false,
            oom_killed: false,
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxBackend for ScriptedSandbox {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports_parallel_runs(&self) -> bool {
        self.parallel
    }

    fn compile_allowance(&self, _language: Language) -> Duration {
        self.compile_allowance
    }

    async fn reserve(&self) -> Result<Option<SlotLease>, SandboxError> {
        match &self.slots {
            Some(pool) => Ok(Some(pool.acquire().await?)),
            None => Ok(None),
        }
    }

    async fn compile(
        &self,
        bundle: &SourceBundle,
        _limits: &ExecutionLimits,
        slot: Option<SlotLease>,
    ) -> Result<CompileOutcome, SandboxError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.compile_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.compile_error {
            return Err(SandboxError::Other(anyhow::anyhow!(message.clone())));
        }
        let workspace = slot.map(|lease| Workspace::slot(std::env::temp_dir(), lease));
        match &self.compile_failure {
            Some(report) => Ok(CompileOutcome::Failed(report.clone())),
            None => Ok(CompileOutcome::Ready(Artifact::new(bundle, workspace))),
        }
    }

    async fn run(
        &self,
        _artifact: &Artifact,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<RunTelemetry, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen_limits.lock().unwrap().push(limits.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.scripts.get(stdin).cloned() {
            None => Ok(Self::echo(stdin)),
            Some(Script::Reply(telemetry)) => Ok(telemetry),
            Some(Script::Fail(message)) => Err(SandboxError::Other(anyhow::anyhow!(message))),
            Some(Script::Compilation(message)) => Err(SandboxError::Compilation(message)),
            Some(Script::Panic) => panic!("scripted backend panic"),
            Some(Script::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn release(&self, artifact: Artifact) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        drop(artifact);
    }
}
