use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::engine::{
    config::IsolateConfig,
    models::Language,
    sandbox::{
        Artifact, CompileOutcome, CompileReport, ExecutionLimits, RunTelemetry, SandboxBackend,
        SandboxError, SlotLease, SlotPool, SourceBundle, Workspace,
        exec::{read_limited, run_command, seconds_arg},
    },
};

const SANDBOX_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const HOUSEKEEPING_DEADLINE: Duration = Duration::from_secs(10);
/// Sandbox set-up and meta file handling around one `--run`.
const RUN_OVERHEAD: Duration = Duration::from_secs(1);

/// IOI isolate driven through its command line. Each submission leases one
/// box id from the pool for its compile step and all of its runs.
///
/// isolate's wall clock is limit + grace/2 and the process deadline is
/// limit + grace + `RUN_OVERHEAD`/2. Both expire before the runner's bound
/// of limit + grace + `RUN_OVERHEAD`.
pub struct IsolateSandbox {
    config: IsolateConfig,
    pool: SlotPool,
    compile_timeout: Duration,
    grace: Duration,
}

/// Meta file path, removed on drop so a cancelled run leaves nothing behind.
struct MetaFile(PathBuf);

/// Parsed `--meta` file.
#[derive(Debug, Clone, Default, PartialEq)]
struct Meta {
    status: Option<String>,
    message: Option<String>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    wall_time_ms: Option<u64>,
    max_rss_kb: Option<u64>,
    cg_mem_kb: Option<u64>,
    cg_oom_killed: bool,
}

/// Files and limits for one `isolate --run` invocation.
struct RunPlan<'a> {
    box_id: u32,
    meta: &'a Path,
    limits: &'a ExecutionLimits,
    stdin: Option<&'a str>,
    stdout: &'a str,
    stderr: &'a str,
    unlimited_processes: bool,
    argv: Vec<String>,
}

impl IsolateSandbox {
    pub fn new(config: IsolateConfig, compile_timeout: Duration, grace: Duration) -> Self {
        let pool = SlotPool::new(config.box_base, config.box_count);
        Self {
            config,
            pool,
            compile_timeout,
            grace,
        }
    }

    fn wall_time_ms(&self, limits: &ExecutionLimits) -> u64 {
        limits.wall_time_ms + (self.grace / 2).as_millis() as u64
    }

    fn process_deadline(&self, limits: &ExecutionLimits) -> Duration {
        limits.wall_time() + self.grace + RUN_OVERHEAD / 2
    }

    fn base_args(&self, box_id: u32) -> Vec<String> {
        let mut args = vec![format!("--box-id={box_id}")];
        if self.config.use_cgroups {
            args.push("--cg".to_string());
        }
        args
    }

    fn run_args(&self, plan: &RunPlan<'_>) -> Vec<String> {
        let limits = plan.limits;
        let mut args = self.base_args(plan.box_id);
        args.push(format!("--meta={}", plan.meta.display()));
        args.push(format!("--time={}", seconds_arg(limits.wall_time_ms)));
        args.push(format!("--wall-time={}", seconds_arg(self.wall_time_ms(limits))));
        args.push("--extra-time=0.5".to_string());
        if self.config.use_cgroups {
            args.push(format!("--cg-mem={}", limits.memory_kb()));
        } else {
            args.push(format!("--mem={}", limits.memory_kb()));
        }
        if plan.unlimited_processes {
            args.push("--processes".to_string());
        } else {
            args.push(format!("--processes={}", limits.max_processes));
        }
        if let Some(stdin) = plan.stdin {
            args.push(format!("--stdin={stdin}"));
        }
        args.push(format!("--stdout={}", plan.stdout));
        args.push(format!("--stderr={}", plan.stderr));
        args.push(format!("--env={SANDBOX_PATH}"));
        args.push("--env=HOME=/tmp".to_string());
        args.push("--run".to_string());
        args.push("--".to_string());
        args.extend(plan.argv.iter().cloned());
        args
    }

    async fn isolate(&self, args: Vec<String>, deadline: Duration) -> anyhow::Result<String> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args);
        let out = run_command(cmd, None, deadline, 64 * 1024).await?;
        if out.timed_out {
            return Err(anyhow!("isolate {:?} did not finish in time", args.last()));
        }
        if out.exit_code != 0 {
            return Err(anyhow!(
                "isolate {:?} failed with code {}: {}",
                args.last(),
                out.exit_code,
                out.stderr.trim()
            ));
        }
        Ok(out.stdout)
    }

    async fn cleanup(&self, box_id: u32) -> anyhow::Result<()> {
        let mut args = self.base_args(box_id);
        args.push("--cleanup".to_string());
        self.isolate(args, HOUSEKEEPING_DEADLINE).await.map(|_| ())
    }

    async fn init(&self, box_id: u32) -> anyhow::Result<PathBuf> {
        let mut args = self.base_args(box_id);
        args.push("--init".to_string());
        let root = self.isolate(args, HOUSEKEEPING_DEADLINE).await?;
        let root = root.trim();
        if root.is_empty() {
            return Err(anyhow!("isolate --init printed no box path"));
        }
        Ok(Path::new(root).join("box"))
    }

    /// Runs one command in the box and returns its meta file and captured
    /// output.
    async fn execute(&self, plan: RunPlan<'_>, box_dir: &Path) -> anyhow::Result<(Meta, String, String)> {
        let limits = plan.limits;
        let args = self.run_args(&plan);
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args);
        let out = run_command(cmd, None, self.process_deadline(limits), 64 * 1024).await?;

        let meta = match tokio::fs::read_to_string(plan.meta).await {
            Ok(raw) => parse_meta(&raw),
            Err(err) => {
                return Err(anyhow!(
                    "isolate exited with {} without a meta file ({err}): {}",
                    out.exit_code,
                    out.stderr.trim()
                ));
            }
        };
        if meta.status.as_deref() == Some("XX") {
            return Err(anyhow!(
                "isolate internal error: {}",
                meta.message.clone().unwrap_or_default()
            ));
        }

        let stdout = read_capped(&box_dir.join(plan.stdout), limits.max_output_bytes).await;
        let stderr = read_capped(&box_dir.join(plan.stderr), limits.max_output_bytes).await;
        Ok((meta, stdout, stderr))
    }
}

#[async_trait]
impl SandboxBackend for IsolateSandbox {
    fn name(&self) -> &'static str {
        "isolate"
    }

    fn startup_allowance(&self, _language: Language) -> Duration {
        RUN_OVERHEAD
    }

    /// `--cleanup` and `--init` before the build.
    fn compile_allowance(&self, _language: Language) -> Duration {
        HOUSEKEEPING_DEADLINE * 2 + RUN_OVERHEAD
    }

    async fn reserve(&self) -> Result<Option<SlotLease>, SandboxError> {
        Ok(Some(self.pool.acquire().await?))
    }

    async fn compile(
        &self,
        bundle: &SourceBundle,
        limits: &ExecutionLimits,
        slot: Option<SlotLease>,
    ) -> Result<CompileOutcome, SandboxError> {
        let lease = match slot {
            Some(lease) => lease,
            None => self.pool.acquire().await?,
        };
        let box_id = lease.id();
        // A previous holder may have left the box initialized.
        let _ = self.cleanup(box_id).await;
        let box_dir = self.init(box_id).await?;
        tracing::debug!(box_id, submission_id = %bundle.submission_id, "isolate box ready");

        let artifact = Artifact::new(bundle, Some(Workspace::slot(box_dir.clone(), lease)));
        tokio::fs::write(box_dir.join(artifact.spec.source_name), bundle.code.as_bytes())
            .await
            .context("failed to stage source in box")?;

        let Some(argv) = artifact.spec.compile_argv() else {
            return Ok(CompileOutcome::Ready(artifact));
        };
        let meta_file = MetaFile::new();
        let compile_limits = ExecutionLimits {
            wall_time_ms: (self.compile_timeout.as_millis() as u64).max(limits.wall_time_ms),
            ..limits.clone()
        };
        let plan = RunPlan {
            box_id,
            meta: meta_file.path(),
            limits: &compile_limits,
            stdin: None,
            stdout: "compile.out",
            stderr: "compile.err",
            unlimited_processes: true,
            argv: resolve_argv(&argv),
        };
        let (meta, stdout, stderr) = self.execute(plan, &box_dir).await?;

        if meta.status.as_deref() == Some("TO") {
            return Ok(CompileOutcome::Failed(CompileReport {
                exit_code: -1,
                stdout,
                stderr: format!("compilation timed out after {} ms", compile_limits.wall_time_ms),
            }));
        }
        let exit_code = meta.exit_code();
        if exit_code != 0 {
            return Ok(CompileOutcome::Failed(CompileReport {
                exit_code,
                stdout,
                stderr,
            }));
        }
        Ok(CompileOutcome::Ready(artifact))
    }

    async fn run(
        &self,
        artifact: &Artifact,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<RunTelemetry, SandboxError> {
        let workspace = artifact.workspace()?;
        let box_id = workspace
            .slot_id()
            .context("isolate artifact is missing its box lease")?;
        let box_dir = workspace.path();
        tokio::fs::write(box_dir.join("input.txt"), stdin.as_bytes())
            .await
            .context("failed to stage stdin in box")?;

        let meta_file = MetaFile::new();
        let plan = RunPlan {
            box_id,
            meta: meta_file.path(),
            limits,
            stdin: Some("input.txt"),
            stdout: "stdout.txt",
            stderr: "stderr.txt",
            unlimited_processes: false,
            argv: resolve_argv(&artifact.spec.run_argv()),
        };
        let (meta, stdout, stderr) = self.execute(plan, box_dir).await?;

        Ok(RunTelemetry {
            exit_code: meta.exit_code(),
            stdout,
            stderr,
            elapsed_ms: meta.wall_time_ms.unwrap_or(0),
            peak_memory_kb: meta.cg_mem_kb.or(meta.max_rss_kb),
            timed_out: meta.status.as_deref() == Some("TO"),
            signaled: meta.exit_signal.is_some(),
            oom_killed: meta.cg_oom_killed,
        })
    }

    async fn release(&self, artifact: Artifact) {
        if let Some(box_id) = artifact.workspace.as_ref().and_then(Workspace::slot_id) {
            if let Err(err) = self.cleanup(box_id).await {
                tracing::warn!(box_id, error = %err, "isolate cleanup failed");
            }
        }
        drop(artifact);
    }
}

impl Meta {
    fn exit_code(&self) -> i32 {
        match (self.exit_code, self.exit_signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) if self.status.is_some() => -1,
            (None, None) => 0,
        }
    }
}

fn parse_meta(raw: &str) -> Meta {
    let fields: HashMap<&str, &str> = raw
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect();
    let seconds_to_ms = |key: &str| {
        fields
            .get(key)
            .and_then(|v| v.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0).round() as u64)
    };
    Meta {
        status: fields.get("status").map(|s| s.to_string()),
        message: fields.get("message").map(|s| s.to_string()),
        exit_code: fields.get("exitcode").and_then(|v| v.parse().ok()),
        exit_signal: fields.get("exitsig").and_then(|v| v.parse().ok()),
        wall_time_ms: seconds_to_ms("time-wall"),
        max_rss_kb: fields.get("max-rss").and_then(|v| v.parse().ok()),
        cg_mem_kb: fields.get("cg-mem").and_then(|v| v.parse().ok()),
        cg_oom_killed: fields.get("cg-oom-killed").is_some_and(|v| *v == "1"),
    }
}

/// isolate calls execve directly, so bare program names need a full path.
fn resolve_argv(argv: &[String]) -> Vec<String> {
    let mut resolved = argv.to_vec();
    if let Some(program) = resolved.first_mut() {
        if !program.starts_with('/') && !program.starts_with("./") {
            if let Ok(path) = which::which(program.as_str()) {
                *program = path.to_string_lossy().to_string();
            }
        }
    }
    resolved
}

impl MetaFile {
    fn new() -> Self {
        Self(std::env::temp_dir().join(format!("judge-isolate-{}.meta", Uuid::new_v4().as_simple())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for MetaFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

async fn read_capped(path: &Path, limit: usize) -> String {
    match tokio::fs::File::open(path).await {
        Ok(file) => String::from_utf8_lossy(&read_limited(file, limit).await).to_string(),
        Err(_) => String::new(),
    }
}
