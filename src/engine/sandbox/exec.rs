use std::{
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
};

/// Exit codes that wrappers such as GNU `timeout` use for an expired limit.
pub const TIMEOUT_EXIT_CODES: [i32; 2] = [124, 142];

const PIPE_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }
}

/// Spawns `cmd`, feeds it `stdin`, and waits at most `deadline`. On expiry the
/// child is killed and the output gathered so far is returned with
/// `timed_out` set.
pub async fn run_command(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    deadline: Duration,
    output_limit: usize,
) -> anyhow::Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let started = Instant::now();
    let mut child = cmd.spawn().context("failed to spawn sandbox command")?;
    if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), stdin) {
        tokio::spawn(async move {
            let _ = pipe.write_all(&bytes).await;
            let _ = pipe.shutdown().await;
        });
    }

    let stdout = child.stdout.take().context("missing stdout pipe")?;
    let stderr = child.stderr.take().context("missing stderr pipe")?;
    let stdout_task = tokio::spawn(async move { read_limited(stdout, output_limit).await });
    let stderr_task = tokio::spawn(async move { read_limited(stderr, output_limit).await });

    let (status, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(err)) => return Err(err).context("sandbox command wait failed"),
        Err(_) => {
            let _ = child.kill().await;
            (None, true)
        }
    };
    let elapsed = started.elapsed();

    // Grandchildren may keep the pipes open after a kill.
    let stdout = tokio::time::timeout(PIPE_DRAIN, stdout_task)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();
    let stderr = tokio::time::timeout(PIPE_DRAIN, stderr_task)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

    let (exit_code, signal) = match status {
        Some(status) => decode_status(status),
        None => (-1, Some(9)),
    };

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        elapsed,
        timed_out,
    })
}

#[cfg(unix)]
fn decode_status(status: ExitStatus) -> (i32, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => (code, None),
        (None, Some(signal)) => (128 + signal, Some(signal)),
        (None, None) => (-1, None),
    }
}

#[cfg(not(unix))]
fn decode_status(status: ExitStatus) -> (i32, Option<i32>) {
    (status.code().unwrap_or(-1), None)
}

pub async fn read_limited<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
            Err(_) => break,
        }
    }
    out
}

/// Formats seconds for command-line tools that accept fractional values.
pub fn seconds_arg(ms: u64) -> String {
    format!("{:.3}", ms as f64 / 1000.0)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = run_command(
            sh("read line; echo \"got $line\"; echo oops >&2; exit 3"),
            Some(b"hello\n".to_vec()),
            Duration::from_secs(5),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout, "got hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn kills_commands_that_outlive_the_deadline() {
        let out = run_command(sh("exec sleep 5"), None, Duration::from_millis(200), 1024)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(out.elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn truncates_output_at_the_limit() {
        let out = run_command(
            sh("yes | head -c 10000"),
            None,
            Duration::from_secs(5),
            64,
        )
        .await
        .unwrap();
        assert_eq!(out.stdout.len(), 64);
    }

    #[tokio::test]
    async fn reports_signals_as_shell_style_exit_codes() {
        let out = run_command(sh("kill -SEGV $$"), None, Duration::from_secs(5), 1024)
            .await
            .unwrap();
        assert_eq!(out.signal, Some(11));
        assert_eq!(out.exit_code, 139);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let cmd = Command::new("/definitely/not/a/binary");
        assert!(run_command(cmd, None, Duration::from_secs(1), 16).await.is_err());
    }

    #[test]
    fn formats_fractional_seconds() {
        assert_eq!(seconds_arg(1500), "1.500");
        assert_eq!(seconds_arg(20), "0.020");
    }
}
