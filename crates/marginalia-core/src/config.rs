//! Configuration for the personalization engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{CoreError, Result};

/// Main configuration for the personalization engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Default decoding parameters
    pub generation: GenerationDefaults,

    /// Adapter persistence settings
    pub adapters: AdapterConfig,

    /// Supervised adapter training settings
    pub trainer: TrainerConfig,

    /// Exploration/exploitation controller settings
    pub policy: PolicyConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Decoding defaults applied to engine-issued generation requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    /// Maximum number of tokens to generate per note
    pub max_tokens: usize,

    /// Sampling temperature
    pub temperature: f32,

    /// Top-k filtering (0 disables)
    pub top_k: usize,

    /// Nucleus filtering threshold (1.0 disables)
    pub top_p: f32,

    /// Seed for reproducible sampling; fresh entropy per request when absent
    pub seed: Option<u64>,

    /// Capacity of the channel used to stream tokens to async callers
    pub stream_buffer: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 0.5,
            top_k: 0,
            top_p: 1.0,
            seed: None,
            stream_buffer: 32,
        }
    }
}

/// Adapter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Root directory holding one sub-directory per user
    pub root_dir: PathBuf,

    /// Number of bundle versions retained per user after a save
    pub keep_versions: usize,

    /// Number of loaded bundles kept in memory
    pub cache_capacity: usize,

    /// Extra attempts after a retryable storage failure
    pub max_storage_retries: u32,

    /// Train automatically once a user has this many pending likes
    pub auto_train_after_likes: Option<usize>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("user_adapters"),
            keep_versions: 2,
            cache_capacity: 64,
            max_storage_retries: 2,
            auto_train_after_likes: None,
        }
    }
}

/// Low-rank adapter training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Rank of the weight delta
    pub rank: usize,

    /// Scaling numerator; the delta is multiplied by alpha / rank
    pub alpha: f32,

    /// SGD learning rate
    pub learning_rate: f32,

    /// Fixed optimization step budget
    pub max_steps: usize,

    /// Sequences per optimization step
    pub batch_size: usize,

    /// Sequences longer than this are truncated
    pub max_seq_len: usize,

    /// Gradient norm clip threshold
    pub max_grad_norm: f32,

    /// Abort the run after this many seconds
    pub deadline_secs: Option<u64>,

    /// Continue from the user's current adapter when one exists
    pub warm_start: bool,

    /// Seed for adapter initialization
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 32.0,
            learning_rate: 2e-4,
            max_steps: 200,
            batch_size: 4,
            max_seq_len: 512,
            max_grad_norm: 1.0,
            deadline_secs: None,
            warm_start: true,
            seed: 42,
        }
    }
}

impl TrainerConfig {
    /// Training deadline as a duration
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Epsilon-greedy controller and replay memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Wrap resolved models with the policy (the `Reinforced` handle)
    pub enabled: bool,

    /// Initial exploration rate
    pub epsilon: f32,

    /// Multiplicative decay applied after every decision
    pub epsilon_decay: f32,

    /// Lower bound for the exploration rate
    pub epsilon_min: f32,

    /// Discount applied to the best future value
    pub gamma: f32,

    /// Replay memory capacity
    pub memory_capacity: usize,

    /// Minibatch size drawn during replay
    pub batch_size: usize,

    /// Run a replay pass after this many remembered entries
    pub replay_interval: usize,

    /// Step size for value updates
    pub learning_rate: f32,

    /// Hashed feature dimension of state snapshots
    pub feature_dim: usize,

    /// Seed for the exploration and minibatch RNG
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epsilon: 1.0,
            epsilon_decay: 0.995,
            epsilon_min: 0.01,
            gamma: 0.95,
            memory_capacity: 1000,
            batch_size: 32,
            replay_interval: 8,
            learning_rate: 0.01,
            feature_dim: 64,
            seed: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,

    /// Log every generated token at trace level
    pub trace_tokens: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            trace_tokens: false,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::storage("CONFIG_READ_FAILED", "Failed to read configuration", path, e))?;
        let config: Self = toml::from_str(&content).map_err(|e| CoreError::Configuration {
            code: "CONFIG_PARSE_FAILED",
            message: e.to_string(),
            suggestion: "Check the TOML syntax and field names".to_string(),
            config_path: Some(path.to_path_buf()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            CoreError::configuration("CONFIG_SERIALIZE_FAILED", e.to_string(), "Report this as a bug")
        })?;
        std::fs::write(path, content)
            .map_err(|e| CoreError::storage("CONFIG_WRITE_FAILED", "Failed to write configuration", path, e))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.generation.max_tokens == 0 {
            return Err(invalid("generation.max_tokens must be greater than 0"));
        }

        if !(self.generation.top_p > 0.0 && self.generation.top_p <= 1.0) {
            return Err(invalid("generation.top_p must be in (0, 1]"));
        }

        if self.generation.stream_buffer == 0 {
            return Err(invalid("generation.stream_buffer must be greater than 0"));
        }

        if self.adapters.keep_versions == 0 {
            return Err(invalid("adapters.keep_versions must be at least 1"));
        }

        if self.adapters.cache_capacity == 0 {
            return Err(invalid("adapters.cache_capacity must be at least 1"));
        }

        if self.trainer.rank == 0 {
            return Err(invalid("trainer.rank must be greater than 0"));
        }

        if self.trainer.max_steps == 0 || self.trainer.batch_size == 0 {
            return Err(invalid("trainer.max_steps and trainer.batch_size must be greater than 0"));
        }

        if !(self.trainer.learning_rate.is_finite() && self.trainer.learning_rate > 0.0) {
            return Err(invalid("trainer.learning_rate must be a positive number"));
        }

        let policy = &self.policy;
        if !(0.0..=1.0).contains(&policy.epsilon_min) || !(0.0..=1.0).contains(&policy.epsilon) {
            return Err(invalid("policy.epsilon and policy.epsilon_min must be within [0, 1]"));
        }

        if policy.epsilon < policy.epsilon_min {
            return Err(invalid("policy.epsilon must not be below policy.epsilon_min"));
        }

        if !(policy.epsilon_decay > 0.0 && policy.epsilon_decay <= 1.0) {
            return Err(invalid("policy.epsilon_decay must be in (0, 1]"));
        }

        if policy.memory_capacity == 0 || policy.batch_size == 0 || policy.feature_dim == 0 {
            return Err(invalid(
                "policy.memory_capacity, policy.batch_size and policy.feature_dim must be greater than 0",
            ));
        }

        if policy.replay_interval == 0 {
            return Err(invalid("policy.replay_interval must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> CoreError {
    CoreError::configuration("CONFIG_INVALID", message, "Fix the value in the configuration file")
}
