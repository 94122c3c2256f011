use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow};

use crate::engine::{compare::ComparePolicy, verdict::UnknownMemoryPolicy};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub sandbox_backend: SandboxBackendKind,
    pub piston: PistonConfig,
    pub isolate: IsolateConfig,
    pub docker: DockerConfig,
    pub process: ProcessConfig,
    pub judging: JudgingConfig,
    pub problems_path: Option<PathBuf>,
    pub persistence_path: Option<PathBuf>,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct PistonConfig {
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct IsolateConfig {
    pub binary: String,
    pub box_base: u32,
    pub box_count: u32,
    pub use_cgroups: bool,
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub binary: String,
}

#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub timeout_bin: Option<String>,
    pub time_bin: Option<String>,
}

/// Knobs shared by every backend and by the verdict logic.
#[derive(Debug, Clone)]
pub struct JudgingConfig {
    pub grace: Duration,
    pub compile_timeout: Duration,
    pub compile_memory_mb: u64,
    pub max_output_bytes: usize,
    pub max_processes: u64,
    pub case_concurrency: usize,
    pub compare_policy: ComparePolicy,
    pub unknown_memory: UnknownMemoryPolicy,
    pub default_time_limit_secs: f64,
    pub default_memory_limit_mb: u64,
}

impl Default for JudgingConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(1000),
            compile_timeout: Duration::from_millis(10_000),
            compile_memory_mb: 512,
            max_output_bytes: 64 * 1024,
            max_processes: 64,
            case_concurrency: 1,
            compare_policy: ComparePolicy::Lines,
            unknown_memory: UnknownMemoryPolicy::Pass,
            default_time_limit_secs: 20.0,
            default_memory_limit_mb: 128,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;
        let worker_count = env_parse("WORKER_COUNT", 4usize).max(1);

        let defaults = JudgingConfig::default();
        let judging = JudgingConfig {
            grace: Duration::from_millis(env_parse("GRACE_MS", 1000u64)),
            compile_timeout: Duration::from_millis(env_parse("COMPILE_TIMEOUT_MS", 10_000u64)),
            compile_memory_mb: env_parse("COMPILE_MEMORY_MB", defaults.compile_memory_mb),
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            max_processes: env_parse("MAX_PROCESSES", defaults.max_processes),
            case_concurrency: env_parse("CASE_CONCURRENCY", 1usize).max(1),
            compare_policy: env_enum("COMPARE_POLICY", defaults.compare_policy)?,
            unknown_memory: env_enum("UNKNOWN_MEMORY", defaults.unknown_memory)?,
            default_time_limit_secs: env_parse(
                "DEFAULT_TIME_LIMIT_SECS",
                defaults.default_time_limit_secs,
            ),
            default_memory_limit_mb: env_parse(
                "DEFAULT_MEMORY_LIMIT_MB",
                defaults.default_memory_limit_mb,
            ),
        };

        Ok(Self {
            bind_addr,
            worker_count,
            queue_capacity: env_parse("QUEUE_CAPACITY", 1024usize).max(1),
            sandbox_backend: env_enum("SANDBOX_BACKEND", SandboxBackendKind::Piston)?,
            piston: PistonConfig {
                api_url: env::var("PISTON_API_URL")
                    .unwrap_or_else(|_| "http://piston:2000".to_string()),
            },
            isolate: IsolateConfig {
                binary: env::var("ISOLATE_BIN").unwrap_or_else(|_| "isolate".to_string()),
                box_base: env_parse("ISOLATE_BOX_BASE", 0u32),
                box_count: env_parse("ISOLATE_BOX_COUNT", worker_count as u32).max(1),
                use_cgroups: env_parse("ISOLATE_CGROUPS", true),
            },
            docker: DockerConfig {
                binary: env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string()),
            },
            process: ProcessConfig {
                timeout_bin: optional_tool("PROCESS_TIMEOUT_BIN", "timeout"),
                time_bin: optional_tool("PROCESS_TIME_BIN", "/usr/bin/time"),
            },
            judging,
            problems_path: env::var("PROBLEMS_PATH").ok().map(PathBuf::from),
            persistence_path: env::var("PERSIST_RESULTS_PATH").ok().map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Piston,
    Isolate,
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "piston" => Ok(Self::Piston),
            "isolate" => Ok(Self::Isolate),
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

/// An empty value (or "none") disables the tool.
fn optional_tool(key: &str, default: &str) -> Option<String> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(value.to_string())
    }
}

fn env_enum<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr<Err = String>,
{
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|e| anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_kinds_case_insensitively() {
        assert_eq!("Isolate".parse::<SandboxBackendKind>().unwrap(), SandboxBackendKind::Isolate);
        assert_eq!("PISTON".parse::<SandboxBackendKind>().unwrap(), SandboxBackendKind::Piston);
        assert!("firecracker".parse::<SandboxBackendKind>().is_err());
    }

    #[test]
    fn judging_defaults_are_sequential_and_line_based() {
        let defaults = JudgingConfig::default();
        assert_eq!(defaults.case_concurrency, 1);
        assert_eq!(defaults.compare_policy, ComparePolicy::Lines);
        assert_eq!(defaults.unknown_memory, UnknownMemoryPolicy::Pass);
        assert_eq!(defaults.default_memory_limit_mb, 128);
    }
}
