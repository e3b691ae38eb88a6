//! Configuration types.
//!
//! Everything is read from `SIM_*` environment variables with defaults that
//! work for a single-host install.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// How the supervisor executes jobs it accepts over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run jobs through an in-process job tracker.
    Local,
    /// Queue jobs for remote agents to pick up.
    Agent,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "agent" => Ok(Self::Agent),
            other => Err(format!("expected `local` or `agent`, got `{other}`")),
        }
    }
}

/// Settings shared by every process backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// How long a killed job gets to exit before it is force-killed.
    pub grace_period: Duration,
    /// Environment variable prefixes removed before launching a job.
    pub env_strip_prefixes: Vec<String>,
    /// Log file (relative to the run directory) receiving stdout and stderr.
    pub run_log: String,
    /// Command run inside the run directory after a job is canceled.
    pub cancel_cleanup: Option<Vec<String>>,
    /// Container backend settings, if enabled.
    pub container: Option<ContainerConfig>,
    /// Batch backend settings, if enabled.
    pub batch: Option<BatchConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            env_strip_prefixes: vec!["SIM_".to_string()],
            run_log: "run.log".to_string(),
            cancel_cleanup: None,
            container: None,
            batch: None,
        }
    }
}

impl BackendConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let grace_period = env_parse::<u64>("SIM_GRACE_PERIOD_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.grace_period);

        let env_strip_prefixes = std::env::var("SIM_ENV_STRIP_PREFIXES")
            .map(|v| split_list(&v, ','))
            .unwrap_or(defaults.env_strip_prefixes);

        let run_log = std::env::var("SIM_RUN_LOG").unwrap_or(defaults.run_log);

        let cancel_cleanup = std::env::var("SIM_CANCEL_CLEANUP_CMD")
            .ok()
            .map(|v| split_argv(&v))
            .filter(|argv| !argv.is_empty());

        let container = std::env::var("SIM_CONTAINER_IMAGE").ok().map(|image| {
            ContainerConfig {
                runtime: std::env::var("SIM_CONTAINER_RUNTIME")
                    .unwrap_or_else(|_| "docker".to_string()),
                image,
            }
        });

        let batch = if std::env::var("SIM_SBATCH_ENABLED").is_ok_and(|v| v == "1") {
            Some(BatchConfig::from_env()?)
        } else {
            None
        };

        Ok(Self {
            grace_period,
            env_strip_prefixes,
            run_log,
            cancel_cleanup,
            container,
            batch,
        })
    }
}

/// Container backend settings.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Runtime binary (`docker`, `podman`).
    pub runtime: String,
    /// Image every job runs in.
    pub image: String,
}

/// Batch (SLURM) backend settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub sbatch: String,
    pub scontrol: String,
    pub scancel: String,
    /// Interval between `scontrol show job` polls.
    pub poll_interval: Duration,
    pub partition: Option<String>,
    /// Wall-clock limit passed to `--time`.
    pub time_limit: Option<String>,
    pub nodes: Option<u32>,
    pub tasks: Option<u32>,
    /// Side command reporting progress of a parallel job.
    pub parallel_status: Option<Vec<String>>,
    pub parallel_status_interval: Duration,
    /// Consecutive failed status queries tolerated before the job is
    /// cancelled and reported as an error.
    pub query_retries: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            scontrol: "scontrol".to_string(),
            scancel: "scancel".to_string(),
            poll_interval: Duration::from_secs(2),
            partition: None,
            time_limit: None,
            nodes: None,
            tasks: None,
            parallel_status: None,
            parallel_status_interval: Duration::from_secs(5),
            query_retries: 10,
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            sbatch: std::env::var("SIM_SBATCH_BIN").unwrap_or(defaults.sbatch),
            scontrol: std::env::var("SIM_SCONTROL_BIN").unwrap_or(defaults.scontrol),
            scancel: std::env::var("SIM_SCANCEL_BIN").unwrap_or(defaults.scancel),
            poll_interval: env_parse::<u64>("SIM_SBATCH_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            partition: std::env::var("SIM_SBATCH_PARTITION").ok(),
            time_limit: std::env::var("SIM_SBATCH_TIME").ok(),
            nodes: env_parse("SIM_SBATCH_NODES")?,
            tasks: env_parse("SIM_SBATCH_TASKS")?,
            parallel_status: std::env::var("SIM_PARALLEL_STATUS_CMD")
                .ok()
                .map(|v| split_argv(&v))
                .filter(|argv| !argv.is_empty()),
            parallel_status_interval: env_parse::<u64>("SIM_PARALLEL_STATUS_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.parallel_status_interval),
            query_retries: env_parse("SIM_SBATCH_QUERY_RETRIES")?.unwrap_or(defaults.query_retries),
        })
    }
}

/// Central supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub bind: SocketAddr,
    pub dispatch: DispatchMode,
    pub backends: BackendConfig,
    /// How long finished agent jobs stay queryable.
    pub dispatch_retention: Duration,
    /// Directory for rolling log files, if file logging is wanted.
    pub log_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = env_parse("SIM_SUPERVISOR_BIND")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8001)));
        let dispatch = env_parse("SIM_DISPATCH")?.unwrap_or(DispatchMode::Local);

        Ok(Self {
            bind,
            dispatch,
            backends: BackendConfig::from_env()?,
            dispatch_retention: env_parse::<u64>("SIM_DISPATCH_RETENTION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(3600)),
            log_dir: std::env::var("SIM_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Remote agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Base URL of the supervisor, e.g. `http://127.0.0.1:8001`.
    pub supervisor_url: String,
    /// Sleep between polls when there is no work.
    pub poll_interval: Duration,
    /// Initial sleep after a transport failure.
    pub backoff: Duration,
    /// Upper bound for the failure backoff.
    pub max_backoff: Duration,
    pub backends: BackendConfig,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            supervisor_url: "http://127.0.0.1:8001".to_string(),
            poll_interval: Duration::from_secs(1),
            backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            backends: BackendConfig::default(),
            log_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            agent_id: std::env::var("SIM_AGENT_ID").unwrap_or(defaults.agent_id),
            supervisor_url: std::env::var("SIM_SUPERVISOR_URL")
                .unwrap_or(defaults.supervisor_url),
            poll_interval: env_parse::<u64>("SIM_AGENT_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            backoff: env_parse::<u64>("SIM_AGENT_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.backoff),
            max_backoff: defaults.max_backoff,
            backends: BackendConfig::from_env()?,
            log_dir: std::env::var("SIM_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// Parse an optional environment variable, rejecting unparsable values.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_argv(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_mode_parses() {
        assert_eq!("agent".parse::<DispatchMode>(), Ok(DispatchMode::Agent));
        assert_eq!(" Local ".parse::<DispatchMode>(), Ok(DispatchMode::Local));
        assert!("celery".parse::<DispatchMode>().is_err());
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(
            split_list("SIM_, ,PYKERN_,", ','),
            vec!["SIM_".to_string(), "PYKERN_".to_string()]
        );
    }

    #[test]
    fn invalid_number_is_rejected() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("SIM_TEST_NOT_A_NUMBER", "soon") };
        let err = env_parse::<u64>("SIM_TEST_NOT_A_NUMBER").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        unsafe { std::env::remove_var("SIM_TEST_NOT_A_NUMBER") };
    }

    #[test]
    fn backend_defaults() {
        let cfg = BackendConfig::default();
        assert_eq!(cfg.grace_period, Duration::from_secs(2));
        assert_eq!(cfg.run_log, "run.log");
        assert!(cfg.container.is_none());
        assert!(cfg.batch.is_none());
    }
}
