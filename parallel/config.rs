use super::PoolError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable that overrides the configured parallelism.
pub const PARALLELISM_ENV: &str = "LDGM_PARALLELISM";

const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// How many workers a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// Run every block on the calling thread, in order.
    Serial,
    /// A fixed number of worker threads.
    Workers(usize),
    /// One worker per available CPU.
    #[default]
    Available,
}

impl Parallelism {
    /// Parses `serial`, `all`/`available`, or a positive worker count.
    pub fn parse(value: &str) -> Result<Self, PoolError> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("serial") {
            return Ok(Self::Serial);
        }
        if trimmed.eq_ignore_ascii_case("all") || trimmed.eq_ignore_ascii_case("available") {
            return Ok(Self::Available);
        }
        match trimmed.parse::<usize>() {
            Ok(0) => Err(PoolError::Config(
                "parallelism must be at least one worker".to_string(),
            )),
            Ok(count) => Ok(Self::Workers(count)),
            Err(_) => Err(PoolError::Config(format!(
                "invalid parallelism '{trimmed}'. Expected 'serial', 'all', or a worker count."
            ))),
        }
    }

    /// Requested worker count, or `None` for serial execution.
    pub fn worker_count(self) -> Option<usize> {
        match self {
            Self::Serial => None,
            Self::Workers(count) => Some(count.max(1)),
            Self::Available => Some(num_cpus::get().max(1)),
        }
    }
}

/// Settings for one [`BlockWorkerPool`](super::pool::BlockWorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub parallelism: Parallelism,
    /// How long the supervisor waits for an event before checking worker liveness.
    pub poll_interval_ms: u64,
    pub show_progress: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallelism: Parallelism::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            show_progress: false,
        }
    }
}

impl PoolConfig {
    pub fn serial() -> Self {
        Self {
            parallelism: Parallelism::Serial,
            ..Self::default()
        }
    }

    pub fn with_workers(count: usize) -> Self {
        Self {
            parallelism: Parallelism::Workers(count),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, PoolError> {
        let config: Self = toml::from_str(text).map_err(|e| PoolError::Config(e.to_string()))?;
        if config.poll_interval_ms == 0 {
            return Err(PoolError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if config.parallelism == Parallelism::Workers(0) {
            return Err(PoolError::Config(
                "parallelism must be at least one worker".to_string(),
            ));
        }
        Ok(config)
    }

    /// Applies `LDGM_PARALLELISM` when it is set.
    pub fn with_env_override(self) -> Result<Self, PoolError> {
        self.with_override(std::env::var(PARALLELISM_ENV).ok().as_deref())
    }

    fn with_override(mut self, value: Option<&str>) -> Result<Self, PoolError> {
        if let Some(value) = value {
            self.parallelism = Parallelism::parse(value)?;
            log::debug!("{PARALLELISM_ENV} overrides parallelism with {value:?}");
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
