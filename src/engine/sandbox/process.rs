use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::engine::{
    config::ProcessConfig,
    sandbox::{
        Artifact, CompileOutcome, CompileReport, ExecutionLimits, RunTelemetry, SandboxBackend,
        SandboxError, SlotLease, SourceBundle, Workspace,
        exec::{TIMEOUT_EXIT_CODES, run_command, seconds_arg},
    },
};

/// Plain child processes in a temporary directory. No filesystem or network
/// confinement; only for trusted pipelines.
pub struct ProcessSandbox {
    config: ProcessConfig,
}

impl ProcessSandbox {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    fn wrapped(
        &self,
        argv: &[String],
        dir: &Path,
        limits: &ExecutionLimits,
        time_file: &Path,
    ) -> Command {
        let mut full = Vec::new();
        if let Some(time_bin) = &self.config.time_bin {
            full.push(time_bin.clone());
            full.extend(["-f".to_string(), "%M".to_string(), "-o".to_string()]);
            full.push(time_file.to_string_lossy().to_string());
        }
        if let Some(timeout_bin) = &self.config.timeout_bin {
            full.push(timeout_bin.clone());
            full.push("--kill-after=1".to_string());
            full.push(seconds_arg(limits.wall_time_ms));
        }
        full.extend(argv.iter().map(|arg| resolve_local(arg, dir)));

        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..]);
        cmd.current_dir(dir);
        cmd
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    fn supports_parallel_runs(&self) -> bool {
        true
    }

    async fn compile(
        &self,
        bundle: &SourceBundle,
        limits: &ExecutionLimits,
        _slot: Option<SlotLease>,
    ) -> Result<CompileOutcome, SandboxError> {
        let workspace = Workspace::temp("judge-process-")?;
        let artifact = Artifact::new(bundle, Some(workspace));
        let dir = artifact.workspace()?.path().to_path_buf();
        tokio::fs::write(dir.join(artifact.spec.source_name), bundle.code.as_bytes())
            .await
            .context("failed to stage source")?;

        let Some(argv) = artifact.spec.compile_argv() else {
            return Ok(CompileOutcome::Ready(artifact));
        };
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(&dir);
        let out = run_command(cmd, None, limits.wall_time(), limits.max_output_bytes).await?;
        if out.timed_out {
            return Ok(CompileOutcome::Failed(CompileReport {
                exit_code: -1,
                stdout: out.stdout,
                stderr: format!("compilation timed out after {} ms", limits.wall_time_ms),
            }));
        }
        if out.exit_code != 0 {
            return Ok(CompileOutcome::Failed(CompileReport {
                exit_code: out.exit_code,
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
        let time_file = dir.join(format!(".time-{}", Uuid::new_v4().as_simple()));
        let cmd = self.wrapped(&artifact.spec.run_argv(), dir, limits, &time_file);

        // The wrapper enforces the limit; this deadline only catches a wrapper
        // that failed to.
        let deadline = limits.wall_time() + std::time::Duration::from_secs(2);
        let out = run_command(
            cmd,
            Some(stdin.as_bytes().to_vec()),
            deadline,
            limits.max_output_bytes,
        )
        .await?;

        let peak_memory_kb = match &self.config.time_bin {
            Some(_) => read_peak_kb(&time_file).await,
            None => None,
        };
        let _ = tokio::fs::remove_file(&time_file).await;

        let wrapper_timeout = self.config.timeout_bin.is_some()
            && TIMEOUT_EXIT_CODES.contains(&out.exit_code);
        let timed_out = out.timed_out || wrapper_timeout;

        Ok(RunTelemetry {
            exit_code: out.exit_code,
            elapsed_ms: out.elapsed_ms(),
            stdout: out.stdout,
            stderr: out.stderr,
            peak_memory_kb,
            timed_out,
            signaled: out.signal.is_some(),
            oom_killed: false,
        })
    }
}

fn resolve_local(arg: &str, dir: &Path) -> String {
    match arg.strip_prefix("./") {
        Some(rest) => dir.join(rest).to_string_lossy().to_string(),
        None => arg.to_string(),
    }
}

/// GNU time prints `%M` (peak RSS in KB) on the last line; earlier lines may
/// carry a "Command terminated by signal" notice.
async fn read_peak_kb(path: &Path) -> Option<u64> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    parse_peak_kb(&raw)
}

fn parse_peak_kb(raw: &str) -> Option<u64> {
    raw.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gnu_time_output() {
        assert_eq!(parse_peak_kb("3456\n"), Some(3456));
        assert_eq!(
            parse_peak_kb("Command terminated by signal 9\n81234\n\n"),
            Some(81234)
        );
        assert_eq!(parse_peak_kb(""), None);
        assert_eq!(parse_peak_kb("garbage"), None);
    }

    #[test]
    fn resolves_workspace_relative_programs() {
        let dir = Path::new("/tmp/judge-x");
        assert_eq!(resolve_local("./main", dir), "/tmp/judge-x/main");
        assert_eq!(resolve_local("python3", dir), "python3");
    }

    #[test]
    fn wraps_with_measurement_and_timeout_tools() {
        let sandbox = ProcessSandbox::new(ProcessConfig {
            timeout_bin: Some("timeout".into()),
            time_bin: Some("/usr/bin/time".into()),
        });
        let limits = ExecutionLimits {
            wall_time_ms: 1500,
            memory_bytes: 64 << 20,
            max_output_bytes: 1024,
            max_processes: 8,
        };
        let cmd = sandbox.wrapped(
            &["./main".to_string()],
            Path::new("/w"),
            &limits,
            Path::new("/w/.time"),
        );
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/bin/time");
        let args = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            args,
            vec!["-f", "%M", "-o", "/w/.time", "timeout", "--kill-after=1", "1.500", "/w/main"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_a_script_without_wrappers() {
        let sandbox = ProcessSandbox::new(ProcessConfig {
            timeout_bin: None,
            time_bin: None,
        });
        let workspace = Workspace::temp("judge-process-test-").unwrap();
        let bundle = SourceBundle {
            submission_id: Uuid::new_v4(),
            language: crate::engine::models::Language::Python,
            code: String::new(),
        };
        let mut artifact = Artifact::new(&bundle, Some(workspace));
        artifact.spec.run = &["sh", "-c", "read x; echo $((x * 2))"];
        let limits = ExecutionLimits {
            wall_time_ms: 2000,
            memory_bytes: 64 << 20,
            max_output_bytes: 1024,
            max_processes: 8,
        };
        let telemetry = sandbox.run(&artifact, "21\n", &limits).await.unwrap();
        assert_eq!(telemetry.stdout.trim(), "42");
        assert_eq!(telemetry.exit_code, 0);
        assert_eq!(telemetry.peak_memory_kb, None);
        assert!(!telemetry.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_wrapper_expiry_is_a_timeout() {
        let sandbox = ProcessSandbox::new(ProcessConfig {
            timeout_bin: Some("timeout".into()),
            time_bin: None,
        });
        let workspace = Workspace::temp("judge-process-test-").unwrap();
        let bundle = SourceBundle {
            submission_id: Uuid::new_v4(),
            language: crate::engine::models::Language::Python,
            code: String::new(),
        };
        let mut artifact = Artifact::new(&bundle, Some(workspace));
        artifact.spec.run = &["sleep", "5"];
        let limits = ExecutionLimits {
            wall_time_ms: 200,
            memory_bytes: 64 << 20,
            max_output_bytes: 1024,
            max_processes: 8,
        };
        let telemetry = sandbox.run(&artifact, "", &limits).await.unwrap();
        assert!(telemetry.timed_out);
        assert_eq!(telemetry.exit_code, 124);
        assert!(!telemetry.signaled);
        assert!(telemetry.elapsed_ms < 2000, "took {} ms", telemetry.elapsed_ms);
    }
}
