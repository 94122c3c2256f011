use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::{
    config::PistonConfig,
    models::Language,
    sandbox::{
        Artifact, CompileOutcome, ExecutionLimits, LanguageSpec, RunTelemetry, SandboxBackend,
        SandboxError, SlotLease, SourceBundle,
    },
};

/// Remote Piston service. Piston builds and runs in a single call, so
/// `compile` only stages the source and build failures surface from `run`.
pub struct PistonSandbox {
    client: reqwest::Client,
    execute_url: String,
    compile_timeout: Duration,
    grace: Duration,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    language: &'a str,
    version: &'a str,
    files: Vec<PistonFile<'a>>,
    stdin: &'a str,
    args: Vec<String>,
    compile_timeout: u64,
    run_timeout: u64,
    compile_memory_limit: i64,
    run_memory_limit: i64,
}

#[derive(Debug, Serialize)]
struct PistonFile<'a> {
    name: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    run: Option<StageResult>,
    compile: Option<StageResult>,
}

#[derive(Debug, Default, Deserialize)]
struct StageResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    output: String,
    code: Option<i32>,
    signal: Option<String>,
    status: Option<String>,
    memory: Option<u64>,
    wall_time: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl PistonSandbox {
    pub fn new(config: PistonConfig, compile_timeout: Duration, grace: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .tcp_nodelay(true)
            .build()
            .context("failed to build piston http client")?;
        Ok(Self {
            client,
            execute_url: format!("{}/api/v2/execute", config.api_url.trim_end_matches('/')),
            compile_timeout,
            grace,
        })
    }

    fn request<'a>(
        &self,
        spec: &'a LanguageSpec,
        source: &'a str,
        stdin: &'a str,
        limits: &ExecutionLimits,
    ) -> ExecuteRequest<'a> {
        ExecuteRequest {
            language: spec.piston_language,
            version: spec.piston_version,
            files: vec![PistonFile {
                name: spec.source_name,
                content: source,
            }],
            stdin,
            args: Vec::new(),
            compile_timeout: self.compile_timeout.as_millis() as u64,
            run_timeout: limits.wall_time_ms,
            compile_memory_limit: -1,
            run_memory_limit: i64::try_from(limits.memory_bytes).unwrap_or(i64::MAX),
        }
    }
}

#[async_trait]
impl SandboxBackend for PistonSandbox {
    fn name(&self) -> &'static str {
        "piston"
    }

    fn supports_parallel_runs(&self) -> bool {
        true
    }

    fn startup_allowance(&self, language: Language) -> Duration {
        if LanguageSpec::for_language(&language).is_compiled() {
            self.compile_timeout
        } else {
            Duration::ZERO
        }
    }

    async fn compile(
        &self,
        bundle: &SourceBundle,
        _limits: &ExecutionLimits,
        _slot: Option<SlotLease>,
    ) -> Result<CompileOutcome, SandboxError> {
        Ok(CompileOutcome::Ready(Artifact::new(bundle, None)))
    }

    async fn run(
        &self,
        artifact: &Artifact,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<RunTelemetry, SandboxError> {
        let body = self.request(&artifact.spec, &artifact.source, stdin, limits);
        let budget = limits.wall_time() + self.startup_allowance(artifact.language) + self.grace;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.execute_url)
            .timeout(budget)
            .json(&body)
            .send()
            .await
            .map_err(|err| request_error(err, budget))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(anyhow!("piston rejected execution ({status}): {message}").into());
        }
        let parsed: ExecuteResponse = response
            .json()
            .await
            .map_err(|err| request_error(err, budget))?;
        let round_trip_ms = started.elapsed().as_millis() as u64;

        if let Some(compile) = parsed.compile.as_ref() {
            if compile.code.is_some_and(|code| code != 0) || compile.signal.is_some() {
                return Err(SandboxError::Compilation(compile.diagnostic()));
            }
        }
        let run = parsed
            .run
            .ok_or_else(|| anyhow!("piston response has no run stage"))?;
        Ok(run.into_telemetry(round_trip_ms, limits.max_output_bytes))
    }
}

impl StageResult {
    fn diagnostic(&self) -> String {
        for text in [&self.stderr, &self.output, &self.stdout] {
            let text = text.trim();
            if !text.is_empty() {
                return text.to_string();
            }
        }
        format!("compiler exited with code {}", self.code.unwrap_or(-1))
    }

    fn is_timeout(&self) -> bool {
        match self.status.as_deref() {
            Some(status) => status == "TO",
            None => self.signal.as_deref() == Some("SIGKILL"),
        }
    }

    fn into_telemetry(self, round_trip_ms: u64, output_limit: usize) -> RunTelemetry {
        let signal = self.signal.as_deref().map(signal_number);
        let exit_code = match (self.code, signal) {
            (Some(code), _) => code,
            (None, Some(number)) => 128 + number,
            (None, None) => 0,
        };
        RunTelemetry {
            exit_code,
            timed_out: self.is_timeout(),
            signaled: signal.is_some(),
            oom_killed: false,
            elapsed_ms: self.wall_time.unwrap_or(round_trip_ms),
            peak_memory_kb: self.memory.map(|bytes| bytes / 1024),
            stdout: truncate(self.stdout, output_limit),
            stderr: truncate(self.stderr, output_limit),
        }
    }
}

fn request_error(err: reqwest::Error, budget: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout(budget.as_millis() as u64)
    } else {
        SandboxError::Other(anyhow!(err).context("piston request failed"))
    }
}

fn signal_number(name: &str) -> i32 {
    match name {
        "SIGHUP" => 1,
        "SIGINT" => 2,
        "SIGABRT" => 6,
        "SIGFPE" => 8,
        "SIGKILL" => 9,
        "SIGSEGV" => 11,
        "SIGPIPE" => 13,
        "SIGTERM" => 15,
        "SIGXCPU" => 24,
        "SIGXFSZ" => 25,
        _ => 0,
    }
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
