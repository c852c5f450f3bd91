//! Configuration models for exportkit.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The operator resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for exportkit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Request layer (retry budgets, throttling, admission gate)
    #[serde(default)]
    pub requester: RequesterConfig,

    /// Export run settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Service supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Origin API description
    pub source: SourceConfig,
}

/// Retry and throttling settings for the requester.
///
/// K_i: Defaults follow the origin's hourly quota window; a throttled call
/// sleeps long enough for the window to roll over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequesterConfig {
    /// Retries for transport failures (outer budget)
    #[serde(default = "default_max_general_retries")]
    pub max_general_retries: u32,

    /// Base unit for the linear general backoff, `(1 + attempt) * unit`
    #[serde(default = "default_general_retry_unit_secs")]
    pub general_retry_unit_secs: u64,

    /// Retries for rate-limited responses (inner budget)
    #[serde(default = "default_max_throttled_retries")]
    pub max_throttled_retries: u32,

    /// Fixed cooldown after a rate-limited response
    #[serde(default = "default_throttle_cooldown_secs")]
    pub throttle_cooldown_secs: u64,

    /// Maximum simultaneous in-flight requests to the origin.
    /// Values above 1 trip abuse detection on some origins.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_max_general_retries() -> u32 {
    2
}

fn default_general_retry_unit_secs() -> u64 {
    60
}

fn default_max_throttled_retries() -> u32 {
    3
}

fn default_throttle_cooldown_secs() -> u64 {
    30 * 60
}

fn default_max_concurrency() -> usize {
    1
}

fn default_timeout() -> u64 {
    180
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            max_general_retries: default_max_general_retries(),
            general_retry_unit_secs: default_general_retry_unit_secs(),
            max_throttled_retries: default_max_throttled_retries(),
            throttle_cooldown_secs: default_throttle_cooldown_secs(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Export run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Primary entity ids to skip. Every id must exist in the fetched set.
    #[serde(default)]
    pub excluded: Vec<String>,

    /// Only queue primary entities for external copy, skip the API export
    #[serde(default)]
    pub only_external_copy: bool,

    /// Concurrency of the per-primary linking pass
    #[serde(default = "default_linking_concurrency")]
    pub linking_concurrency: usize,

    /// Capacity of each bounded task queue (in batches)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pause between scheduled exports in `run-no-restarts`
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_linking_concurrency() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    10
}

fn default_interval_secs() -> u64 {
    60 * 60
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            excluded: Vec::new(),
            only_external_copy: false,
            linking_concurrency: default_linking_concurrency(),
            queue_capacity: default_queue_capacity(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Restart policy of the service supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Delay before the first restart
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Upper bound on the restart delay
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Growth factor between consecutive restarts
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// How often the service child polls the cancel inbox
    #[serde(default = "default_cancel_poll_secs")]
    pub cancel_poll_secs: u64,
}

fn default_initial_delay_secs() -> u64 {
    15
}

fn default_max_delay_secs() -> u64 {
    60 * 60
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_cancel_poll_secs() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
            cancel_poll_secs: default_cancel_poll_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_secs(self.cancel_poll_secs.max(1))
    }
}

/// Description of a JSON-over-REST origin.
///
/// Paths may contain `{primary_id}` and `{task_id}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the API (e.g., "https://api.example.com/v1")
    pub base_url: String,

    /// API token (may contain ${ENV_VAR} references)
    #[serde(default)]
    pub api_token: Option<String>,

    /// Environment variable consulted when `api_token` is absent
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,

    /// Value stamped into every record's `ref_type`
    #[serde(default = "default_ref_type")]
    pub ref_type: String,

    /// Page size requested from the origin
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Clone URL template for the external copy, `{name}` is substituted
    #[serde(default)]
    pub clone_url_template: Option<String>,

    /// Primary collection (cursor paginated, incremental by `updated_at`)
    pub primary: EndpointConfig,

    /// Per-primary linking pass (offset paginated)
    #[serde(default)]
    pub linking: Option<EndpointConfig>,

    /// Per-primary task collection feeding the dependent exporters
    #[serde(default)]
    pub tasks: Option<EndpointConfig>,

    /// Per-task dependent collections
    #[serde(default)]
    pub dependents: Vec<DependentConfig>,
}

fn default_api_token_env() -> String {
    "EXPORTKIT_API_TOKEN".to_string()
}

fn default_ref_type() -> String {
    "rest".to_string()
}

fn default_page_size() -> u32 {
    100
}

/// A single collection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Path relative to `base_url`
    pub path: String,

    /// Model name records are emitted under
    pub model: String,
}

/// A dependent collection fetched once per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentConfig {
    /// Path relative to `base_url`, usually containing `{task_id}`
    pub path: String,

    /// Model name records are emitted under
    pub model: String,

    /// Boolean field on the task telling whether the collection is non-empty
    #[serde(default)]
    pub hint_field: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the API token from config or environment.
    ///
    /// B_i(token available) → Result
    pub fn resolve_api_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.source.api_token {
            return Ok(expand_env_vars(token));
        }

        std::env::var(&self.source.api_token_env).map_err(|_| ConfigError::MissingApiToken {
            env_var: self.source.api_token_env.clone(),
        })
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("source.base_url is missing".into()));
        }
        if self.requester.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "requester.max_concurrency must be at least 1".into(),
            ));
        }
        if self.export.linking_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "export.linking_concurrency must be at least 1".into(),
            ));
        }
        if self.export.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "export.queue_capacity must be at least 1".into(),
            ));
        }
        if self.supervisor.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "supervisor.multiplier must be >= 1.0".into(),
            ));
        }
        if self.source.page_size == 0 {
            return Err(ConfigError::Invalid("source.page_size must be positive".into()));
        }
        if !self.source.dependents.is_empty() && self.source.tasks.is_none() {
            return Err(ConfigError::Invalid(
                "source.dependents requires source.tasks".into(),
            ));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return s.to_string();
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Missing required values
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API token: set {env_var} env var or source.api_token in config")]
    MissingApiToken { env_var: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
