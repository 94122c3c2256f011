use std::{path::Path, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use uuid::Uuid;

use crate::engine::{
    config::DockerConfig,
    models::Language,
    sandbox::{
        Artifact, CompileOutcome, CompileReport, ExecutionLimits, RunTelemetry, SandboxBackend,
        SandboxError, SlotLease, SourceBundle, Workspace,
        exec::{ProcessOutput, run_command},
    },
};

const STARTUP_ALLOWANCE: Duration = Duration::from_secs(5);
const HOUSEKEEPING_DEADLINE: Duration = Duration::from_secs(10);

/// One throwaway container per compile and per run. Peak memory is not
/// observable after exit, so it is reported as unknown.
pub struct DockerSandbox {
    config: DockerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerState {
    oom_killed: bool,
    exit_code: i32,
    runtime_ms: Option<u64>,
}

/// Removes the container if the owning future is dropped mid-run.
struct ContainerGuard {
    docker: String,
    name: String,
    armed: bool,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::process::Command::new(&self.docker)
                .args(["rm", "-f", &self.name])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
        }
    }
}

impl DockerSandbox {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn container_args(
        &self,
        name: &str,
        image: &str,
        dir: &Path,
        limits: &ExecutionLimits,
        writable: bool,
        argv: &[String],
    ) -> Vec<String> {
        let mount = format!(
            "{}:/workspace{}",
            dir.display(),
            if writable { "" } else { ":ro" }
        );
        let memory = format!("{}m", limits.memory_mb());
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--pids-limit".to_string(),
            limits.max_processes.to_string(),
            "--cpus".to_string(),
            "1".to_string(),
            "--tmpfs".to_string(),
            "/tmp".to_string(),
            "-v".to_string(),
            mount,
            "-w".to_string(),
            "/workspace".to_string(),
            image.to_string(),
        ];
        args.extend(argv.iter().cloned());
        args
    }

    async fn run_container(
        &self,
        args: Vec<String>,
        name: &str,
        stdin: Option<Vec<u8>>,
        deadline: Duration,
        output_limit: usize,
    ) -> anyhow::Result<(ProcessOutput, Option<ContainerState>)> {
        let mut guard = ContainerGuard {
            docker: self.config.binary.clone(),
            name: name.to_string(),
            armed: true,
        };
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args);
        let out = run_command(cmd, stdin, deadline, output_limit).await?;
        if out.timed_out {
            self.docker(&["kill", name]).await;
        }
        let state = self.inspect(name).await;
        self.docker(&["rm", "-f", name]).await;
        guard.armed = false;
        Ok((out, state))
    }

    async fn inspect(&self, name: &str) -> Option<ContainerState> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args([
            "inspect",
            "--format",
            "{{.State.OOMKilled}} {{.State.ExitCode}} {{.State.StartedAt}} {{.State.FinishedAt}}",
            name,
        ]);
        let out = run_command(cmd, None, HOUSEKEEPING_DEADLINE, 4096).await.ok()?;
        if out.exit_code != 0 {
            tracing::warn!(container = name, stderr = %out.stderr.trim(), "docker inspect failed");
            return None;
        }
        parse_state(&out.stdout)
    }

    async fn docker(&self, args: &[&str]) {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args);
        if let Err(err) = run_command(cmd, None, HOUSEKEEPING_DEADLINE, 4096).await {
            tracing::warn!(?args, error = %err, "docker housekeeping command failed");
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn supports_parallel_runs(&self) -> bool {
        true
    }

    fn startup_allowance(&self, _language: Language) -> Duration {
        STARTUP_ALLOWANCE
    }

    /// Start-up plus the kill, inspect and rm that follow a build.
    fn compile_allowance(&self, _language: Language) -> Duration {
        STARTUP_ALLOWANCE + HOUSEKEEPING_DEADLINE * 3
    }

    async fn compile(
        &self,
        bundle: &SourceBundle,
        limits: &ExecutionLimits,
        _slot: Option<SlotLease>,
    ) -> Result<CompileOutcome, SandboxError> {
        let workspace = Workspace::temp("judge-docker-")?;
        let artifact = Artifact::new(bundle, Some(workspace));
        let dir = artifact.workspace()?.path().to_path_buf();
        tokio::fs::write(dir.join(artifact.spec.source_name), bundle.code.as_bytes())
            .await
            .context("failed to stage source")?;

        let Some(argv) = artifact.spec.compile_argv() else {
            return Ok(CompileOutcome::Ready(artifact));
        };
        let name = container_name(bundle.submission_id, "build");
        let args = self.container_args(&name, artifact.spec.docker_image, &dir, limits, true, &argv);
        let (out, state) = self
            .run_container(
                args,
                &name,
                None,
                limits.wall_time() + STARTUP_ALLOWANCE,
                limits.max_output_bytes,
            )
            .await?;

        if out.timed_out {
            return Ok(CompileOutcome::Failed(CompileReport {
                exit_code: -1,
                stdout: out.stdout,
                stderr: format!("compilation timed out after {} ms", limits.wall_time_ms),
            }));
        }
        let exit_code = state.map(|s| s.exit_code).unwrap_or(out.exit_code);
        if exit_code != 0 {
            return Ok(CompileOutcome::Failed(CompileReport {
                exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
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
        let dir = artifact.workspace()?.path();
        let name = container_name(artifact.submission_id, "run");
        let args = self.container_args(
            &name,
            artifact.spec.docker_image,
            dir,
            limits,
            false,
            &artifact.spec.run_argv(),
        );
        let (out, state) = self
            .run_container(
                args,
                &name,
                Some(stdin.as_bytes().to_vec()),
                limits.wall_time() + STARTUP_ALLOWANCE,
                limits.max_output_bytes,
            )
            .await?;

        let runtime_ms = state.as_ref().and_then(|s| s.runtime_ms);
        let elapsed_ms = runtime_ms.unwrap_or_else(|| out.elapsed_ms());
        let timed_out = out.timed_out || runtime_ms.is_some_and(|ms| ms > limits.wall_time_ms);
        let exit_code = state.as_ref().map(|s| s.exit_code).unwrap_or(out.exit_code);

        Ok(RunTelemetry {
            exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            elapsed_ms,
            peak_memory_kb: None,
            timed_out,
            signaled: exit_code > 128,
            oom_killed: state.is_some_and(|s| s.oom_killed),
        })
    }
}

fn container_name(submission_id: Uuid, stage: &str) -> String {
    let suffix = Uuid::new_v4().as_simple().to_string();
    format!("judge-{}-{stage}-{}", submission_id.as_simple(), &suffix[..8])
}

fn parse_state(raw: &str) -> Option<ContainerState> {
    let mut parts = raw.split_whitespace();
    let oom_killed = parts.next()?.parse::<bool>().ok()?;
    let exit_code = parts.next()?.parse::<i32>().ok()?;
    let started = parts.next().and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let finished = parts.next().and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let runtime_ms = match (started, finished) {
        (Some(started), Some(finished)) if finished >= started => {
            let started = started.with_timezone(&Utc);
            let finished = finished.with_timezone(&Utc);
            Some((finished - started).num_milliseconds().max(0) as u64)
        }
        _ => None,
    };
    Some(ContainerState {
        oom_killed,
        exit_code,
        runtime_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inspect_output() {
        let state = parse_state(
            "true 137 2024-05-01T10:00:00.100000000Z 2024-05-01T10:00:01.350000000Z\n",
        )
        .unwrap();
        assert!(state.oom_killed);
        assert_eq!(state.exit_code, 137);
        assert_eq!(state.runtime_ms, Some(1250));
    }

    #[test]
    fn unfinished_containers_have_no_runtime() {
        let state = parse_state("false 0 2024-05-01T10:00:00Z 0001-01-01T00:00:00Z").unwrap();
        assert!(!state.oom_killed);
        assert_eq!(state.runtime_ms, None);
        assert!(parse_state("").is_none());
    }

    #[test]
    fn run_containers_are_offline_and_read_only() {
        let sandbox = DockerSandbox::new(DockerConfig {
            binary: "docker".into(),
        });
        let limits = ExecutionLimits {
            wall_time_ms: 1000,
            memory_bytes: 256 << 20,
            max_output_bytes: 1024,
            max_processes: 32,
        };
        let args = sandbox.container_args(
            "judge-x",
            "python:3.12-alpine",
            Path::new("/tmp/ws"),
            &limits,
            false,
            &["python3".to_string(), "main.py".to_string()],
        );
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 256m --memory-swap 256m"));
        assert!(joined.contains("--pids-limit 32"));
        assert!(joined.contains("/tmp/ws:/workspace:ro"));
        assert!(joined.ends_with("python:3.12-alpine python3 main.py"));
    }

    #[test]
    fn container_names_are_unique_per_call() {
        let id = Uuid::new_v4();
        assert_ne!(container_name(id, "run"), container_name(id, "run"));
    }
}
