use std::time::Duration as StdDuration;

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError};

use crate::agent::{LearningSettings, DEFAULT_AUTO_SAVE_INTERVAL, DEFAULT_BATCH_SIZE};
use crate::approximator::DEFAULT_LEARNING_RATE;
use crate::checkpoint::{DEFAULT_CHECKPOINT_MEMORY, DEFAULT_MODEL_PATH};
use crate::clock::ClockManager;
use crate::policy::{DEFAULT_EPSILON, DEFAULT_EPSILON_DECAY, DEFAULT_EPSILON_MIN};
use crate::replay::DEFAULT_MEMORY_CAPACITY;

/// Configuration file looked up in the working directory (any format the
/// `config` crate understands, e.g. `Coach.toml`).
pub const CONFIG_FILE: &str = "Coach";
/// Environment overrides, e.g. `COACH_TIMEOUT_HOURS=6`.
pub const ENV_PREFIX: &str = "COACH";
/// Longest feedback window we accept (a century).
pub const MAX_TIMEOUT_HOURS: f64 = 24.0 * 365.0 * 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CoachConfig {
    /// How long a decision waits for feedback before it is penalized.
    pub timeout_hours: f64,
    /// Sweeper polling interval.
    pub loop_interval_seconds: u64,

    pub positive_reward: f64,
    pub negative_reward: f64,
    pub timeout_penalty: f64,

    pub auto_save_interval: u64,
    pub batch_size: usize,
    pub memory_capacity: usize,
    pub checkpoint_memory: usize,

    pub epsilon: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub learning_rate: f64,

    pub model_path: String,
    /// When set, the write endpoints require a matching `X-API-Key` header.
    pub api_key: Option<String>,
    pub port: u16,
    pub log_filename: Option<String>,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            timeout_hours: 12.0,
            loop_interval_seconds: 60,
            positive_reward: 0.8,
            negative_reward: -0.5,
            timeout_penalty: -2.0,
            auto_save_interval: DEFAULT_AUTO_SAVE_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            checkpoint_memory: DEFAULT_CHECKPOINT_MEMORY,
            epsilon: DEFAULT_EPSILON,
            epsilon_min: DEFAULT_EPSILON_MIN,
            epsilon_decay: DEFAULT_EPSILON_DECAY,
            learning_rate: DEFAULT_LEARNING_RATE,
            model_path: DEFAULT_MODEL_PATH.to_string(),
            api_key: None,
            port: 8000,
            log_filename: None,
        }
    }
}

impl CoachConfig {
    /// A builder pre-populated with every default, so no source is required.
    pub fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let d = CoachConfig::default();
        Config::builder()
            .set_default("timeout_hours", d.timeout_hours)?
            .set_default("loop_interval_seconds", d.loop_interval_seconds as i64)?
            .set_default("positive_reward", d.positive_reward)?
            .set_default("negative_reward", d.negative_reward)?
            .set_default("timeout_penalty", d.timeout_penalty)?
            .set_default("auto_save_interval", d.auto_save_interval as i64)?
            .set_default("batch_size", d.batch_size as i64)?
            .set_default("memory_capacity", d.memory_capacity as i64)?
            .set_default("checkpoint_memory", d.checkpoint_memory as i64)?
            .set_default("epsilon", d.epsilon)?
            .set_default("epsilon_min", d.epsilon_min)?
            .set_default("epsilon_decay", d.epsilon_decay)?
            .set_default("learning_rate", d.learning_rate)?
            .set_default("model_path", d.model_path)?
            .set_default("port", d.port as i64)
    }

    /// Reads `Coach.*` from the working directory if present, then the
    /// `COACH_*` environment.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Self::builder()?
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            // Add in settings from env, with a prefix of COACH, e.g. COACH_PORT=9000
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;
        Self::from_config(&settings)
    }

    pub fn from_config(settings: &Config) -> Result<Self, ConfigError> {
        let timeout_hours = settings.get("timeout_hours")?;
        let loop_interval_seconds = settings.get("loop_interval_seconds")?;

        let positive_reward = settings.get("positive_reward")?;
        let negative_reward = settings.get("negative_reward")?;
        let timeout_penalty = settings.get("timeout_penalty")?;

        let auto_save_interval = settings.get("auto_save_interval")?;
        let batch_size = settings.get("batch_size")?;
        let memory_capacity = settings.get("memory_capacity")?;
        let checkpoint_memory = settings.get("checkpoint_memory")?;

        let epsilon = settings.get("epsilon")?;
        let epsilon_min = settings.get("epsilon_min")?;
        let epsilon_decay = settings.get("epsilon_decay")?;
        let learning_rate = settings.get("learning_rate")?;

        let model_path = settings.get_string("model_path")?;
        let api_key = optional_string(settings, "api_key")?.filter(|key| !key.is_empty());
        let port = settings.get("port")?;
        let log_filename = optional_string(settings, "log_filename")?;

        let cfg = CoachConfig {
            timeout_hours,
            loop_interval_seconds,
            positive_reward,
            negative_reward,
            timeout_penalty,
            auto_save_interval,
            batch_size,
            memory_capacity,
            checkpoint_memory,
            epsilon,
            epsilon_min,
            epsilon_decay,
            learning_rate,
            model_path,
            api_key,
            port,
            log_filename,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Message(msg));
        if !(self.timeout_hours.is_finite() && self.timeout_hours > 0.0) {
            return invalid(format!("timeout_hours must be positive, got {}", self.timeout_hours));
        }
        if self.timeout_hours > MAX_TIMEOUT_HOURS {
            return invalid(format!(
                "timeout_hours must be at most {}, got {}",
                MAX_TIMEOUT_HOURS, self.timeout_hours
            ));
        }
        if self.loop_interval_seconds == 0 {
            return invalid("loop_interval_seconds must be positive".to_string());
        }
        if self.batch_size == 0 || self.memory_capacity == 0 {
            return invalid("batch_size and memory_capacity must be positive".to_string());
        }
        // A batch that can never fit means training never runs.
        if self.batch_size > self.memory_capacity {
            return invalid(format!(
                "batch_size ({}) must not exceed memory_capacity ({})",
                self.batch_size, self.memory_capacity
            ));
        }
        for (name, value) in [("epsilon", self.epsilon), ("epsilon_min", self.epsilon_min)] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if !(self.epsilon_decay > 0.0 && self.epsilon_decay <= 1.0) {
            return invalid(format!("epsilon_decay must be within (0, 1], got {}", self.epsilon_decay));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        let rewards = [self.positive_reward, self.negative_reward, self.timeout_penalty];
        if rewards.iter().any(|r| !r.is_finite()) {
            return invalid("rewards must be finite".to_string());
        }
        Ok(())
    }

    /// The expiry window handed out with every decision.
    pub fn window(&self) -> chrono::Duration {
        ClockManager::hours(self.timeout_hours)
    }

    pub fn loop_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.loop_interval_seconds)
    }

    pub fn learning_settings(&self) -> LearningSettings {
        LearningSettings::from(self)
    }
}

impl From<&CoachConfig> for LearningSettings {
    fn from(cfg: &CoachConfig) -> Self {
        LearningSettings {
            batch_size: cfg.batch_size,
            memory_capacity: cfg.memory_capacity,
            checkpoint_memory: cfg.checkpoint_memory,
            auto_save_interval: cfg.auto_save_interval,
            epsilon: cfg.epsilon,
            epsilon_min: cfg.epsilon_min,
            epsilon_decay: cfg.epsilon_decay,
            learning_rate: cfg.learning_rate,
        }
    }
}

fn optional_string(settings: &Config, key: &str) -> Result<Option<String>, ConfigError> {
    match settings.get_string(key) {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
