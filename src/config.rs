//! Service configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `PATCHFORGE_*` environment variables. The CLI applies its own flags last.
//!
//! ```yaml
//! database_path: /var/lib/patchforge/queue.db
//! worker:
//!   num_workers: 8
//!   stale_timeout: 3600000   # milliseconds
//! repair:
//!   max_attempts: 3
//!   primary_attempts: 2
//! verify:
//!   command: npm test
//!   timeout_secs: 600
//! fixers:
//!   primary_model: moonshotai/kimi-k2.5
//!   secondary_model: anthropic/claude-opus-4
//! rate_limits:
//!   services:
//!     openrouter: { capacity: 30, period_secs: 60 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::providers::openrouter::{DEFAULT_MODEL, OPENROUTER_BASE_URL, REQUEST_TIMEOUT_SECS};
use crate::patterns::PatternConfig;
use crate::ratelimit::RateLimitConfig;
use crate::repair::RepairConfig;
use crate::scheduler::WorkerPoolConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// How candidate fixes are verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Shell command run in the job's working directory. Exit code 0 passes.
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: "make test".to_string(),
            timeout_secs: 900,
        }
    }
}

impl VerifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// LLM endpoint and the models behind each fixer tier.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixerConfig {
    pub api_base: String,
    /// Read from the environment when absent from the file.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub primary_model: String,
    pub secondary_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            api_base: OPENROUTER_BASE_URL.to_string(),
            api_key: None,
            primary_model: DEFAULT_MODEL.to_string(),
            secondary_model: "anthropic/claude-opus-4".to_string(),
            temperature: 0.2,
            max_tokens: 16_384,
        }
    }
}

impl std::fmt::Debug for FixerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixerConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("primary_model", &self.primary_model)
            .field("secondary_model", &self.secondary_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// SQLite file holding the queue, the event log and the pattern store.
    pub database_path: PathBuf,
    pub worker: WorkerPoolConfig,
    pub repair: RepairConfig,
    pub patterns: PatternConfig,
    pub verify: VerifyConfig,
    pub fixers: FixerConfig,
    pub rate_limits: RateLimitConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./patchforge.db"),
            worker: WorkerPoolConfig::default(),
            repair: RepairConfig::default(),
            patterns: PatternConfig::default(),
            verify: VerifyConfig::default(),
            fixers: FixerConfig::default(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Loads defaults, the optional YAML file and the process environment.
    ///
    /// Does not validate; callers apply their own overrides first.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parses a YAML file. Missing sections keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Applies `PATCHFORGE_*` overrides read through `lookup`.
    ///
    /// # Environment Variables
    ///
    /// - `PATCHFORGE_DATABASE`: SQLite file path
    /// - `PATCHFORGE_WORKERS`: number of workers
    /// - `PATCHFORGE_POLL_INTERVAL_MS`: idle poll interval
    /// - `PATCHFORGE_STALE_TIMEOUT_SECS`: lock age before reclamation
    /// - `PATCHFORGE_RESOURCE_LIMIT`: claimed jobs per resource key
    /// - `PATCHFORGE_SHUTDOWN_TIMEOUT_SECS`: graceful shutdown bound
    /// - `PATCHFORGE_MAX_ATTEMPTS`: attempt ceiling per job
    /// - `PATCHFORGE_PRIMARY_ATTEMPTS`: attempts before escalation
    /// - `PATCHFORGE_FIXER_RETRIES`: transient retries per attempt
    /// - `PATCHFORGE_VERIFY_COMMAND`: verification shell command
    /// - `PATCHFORGE_VERIFY_TIMEOUT_SECS`: verification timeout
    /// - `PATCHFORGE_API_BASE`: LLM endpoint
    /// - `PATCHFORGE_API_KEY` (or `OPENROUTER_API_KEY`): LLM API key
    /// - `PATCHFORGE_PRIMARY_MODEL`, `PATCHFORGE_SECONDARY_MODEL`: fixer models
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PATCHFORGE_DATABASE") {
            self.database_path = PathBuf::from(val);
        }

        // Worker settings
        if let Some(val) = lookup("PATCHFORGE_WORKERS") {
            self.worker.num_workers = parse_env_value(&val, "PATCHFORGE_WORKERS")?;
        }
        if let Some(val) = lookup("PATCHFORGE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "PATCHFORGE_POLL_INTERVAL_MS")?;
            self.worker.poll_interval = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("PATCHFORGE_STALE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PATCHFORGE_STALE_TIMEOUT_SECS")?;
            self.worker.stale_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("PATCHFORGE_RESOURCE_LIMIT") {
            self.worker.resource_limit = parse_env_value(&val, "PATCHFORGE_RESOURCE_LIMIT")?;
        }
        if let Some(val) = lookup("PATCHFORGE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PATCHFORGE_SHUTDOWN_TIMEOUT_SECS")?;
            self.worker.shutdown_timeout = Duration::from_secs(secs);
        }

        // Repair settings
        if let Some(val) = lookup("PATCHFORGE_MAX_ATTEMPTS") {
            self.repair.max_attempts = parse_env_value(&val, "PATCHFORGE_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("PATCHFORGE_PRIMARY_ATTEMPTS") {
            self.repair.primary_attempts = parse_env_value(&val, "PATCHFORGE_PRIMARY_ATTEMPTS")?;
        }
        if let Some(val) = lookup("PATCHFORGE_FIXER_RETRIES") {
            self.repair.fixer_retries = parse_env_value(&val, "PATCHFORGE_FIXER_RETRIES")?;
        }

        // Verification
        if let Some(val) = lookup("PATCHFORGE_VERIFY_COMMAND") {
            self.verify.command = val;
        }
        if let Some(val) = lookup("PATCHFORGE_VERIFY_TIMEOUT_SECS") {
            self.verify.timeout_secs = parse_env_value(&val, "PATCHFORGE_VERIFY_TIMEOUT_SECS")?;
        }

        // Fixers
        if let Some(val) = lookup("PATCHFORGE_API_BASE") {
            self.fixers.api_base = val;
        }
        if let Some(val) = lookup("PATCHFORGE_API_KEY").or_else(|| lookup("OPENROUTER_API_KEY")) {
            self.fixers.api_key = Some(val);
        }
        if let Some(val) = lookup("PATCHFORGE_PRIMARY_MODEL") {
            self.fixers.primary_model = val;
        }
        if let Some(val) = lookup("PATCHFORGE_SECONDARY_MODEL") {
            self.fixers.secondary_model = val;
        }

        Ok(())
    }

    /// Returns the API key, or an error naming the variable to set.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.fixers
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("PATCHFORGE_API_KEY".to_string()))
    }

    /// Longest a healthy worker can hold a job between lock refreshes.
    ///
    /// The lock is refreshed once per attempt. The first gap covers the
    /// initial verification plus a full attempt: every fixer call with its
    /// rate-limit wait and request timeout, the backoff between retries, and
    /// the re-verification.
    pub fn max_lock_gap(&self) -> Duration {
        let verify = self.verify.timeout().saturating_mul(2);
        let calls = self.repair.fixer_retries.saturating_add(1);
        let per_call = Duration::from_secs(
            self.repair
                .rate_limit_timeout_secs
                .saturating_add(REQUEST_TIMEOUT_SECS),
        );
        let backoff = Duration::from_millis(self.repair.max_backoff_ms)
            .saturating_mul(self.repair.fixer_retries);

        verify
            .saturating_add(per_call.saturating_mul(calls))
            .saturating_add(backoff)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_path cannot be empty".to_string(),
            ));
        }

        // Worker validation
        if self.worker.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker.num_workers must be greater than 0".to_string(),
            ));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "worker.poll_interval must be greater than 0".to_string(),
            ));
        }
        let max_gap = self.max_lock_gap();
        if self.worker.stale_timeout < max_gap {
            return Err(ConfigError::ValidationFailed(format!(
                "worker.stale_timeout ({}s) is shorter than the longest time a healthy worker \
                 can go without refreshing its lock ({}s); raise it or lower verify.timeout_secs, \
                 repair.fixer_retries, repair.max_backoff_ms or repair.rate_limit_timeout_secs",
                self.worker.stale_timeout.as_secs(),
                max_gap.as_secs()
            )));
        }

        // Repair validation
        if self.repair.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "repair.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.repair.primary_attempts > self.repair.max_attempts {
            return Err(ConfigError::ValidationFailed(
                "repair.primary_attempts cannot exceed repair.max_attempts".to_string(),
            ));
        }
        if self.repair.backoff_base_ms > self.repair.max_backoff_ms {
            return Err(ConfigError::ValidationFailed(
                "repair.backoff_base_ms cannot exceed repair.max_backoff_ms".to_string(),
            ));
        }

        // Pattern validation
        if !(0.0..=1.0).contains(&self.patterns.exact_confidence_cap) {
            return Err(ConfigError::ValidationFailed(
                "patterns.exact_confidence_cap must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.patterns.category_multiplier) {
            return Err(ConfigError::ValidationFailed(
                "patterns.category_multiplier must be between 0.0 and 1.0".to_string(),
            ));
        }

        // Verification validation
        if self.verify.command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "verify.command cannot be empty".to_string(),
            ));
        }
        if self.verify.timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "verify.timeout_secs must be greater than 0".to_string(),
            ));
        }

        // Fixer validation
        if self.fixers.primary_model.is_empty() || self.fixers.secondary_model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "fixer models cannot be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.fixers.temperature) {
            return Err(ConfigError::ValidationFailed(
                "fixers.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        // Rate limit validation
        let buckets = std::iter::once(("default", &self.rate_limits.default)).chain(
            self.rate_limits
                .services
                .iter()
                .map(|(name, bucket)| (name.as_str(), bucket)),
        );
        for (name, bucket) in buckets {
            if bucket.capacity <= 0.0 || bucket.period_secs <= 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "rate limit '{}' needs a positive capacity and period",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::ratelimit::BucketConfig;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ForgeConfig::default();
        assert_eq!(config.repair.max_attempts, 3);
        assert_eq!(config.repair.primary_attempts, 2);
        assert_eq!(config.worker.num_workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
database_path: /tmp/forge.db
repair:
  max_attempts: 5
verify:
  command: cargo test
rate_limits:
  services:
    openrouter:
      capacity: 10
      period_secs: 30
"#;
        let config = ForgeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/forge.db"));
        assert_eq!(config.repair.max_attempts, 5);
        assert_eq!(config.repair.primary_attempts, 2);
        assert_eq!(config.verify.command, "cargo test");
        assert_eq!(config.verify.timeout_secs, 900);
        assert_eq!(
            config.rate_limits.services["openrouter"],
            BucketConfig {
                capacity: 10.0,
                period_secs: 30.0
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(ForgeConfig::from_yaml("  \n").unwrap(), ForgeConfig::default());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = ForgeConfig::from_yaml("repair: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ForgeConfig::default();
        config
            .apply_env_with(env(&[
                ("PATCHFORGE_DATABASE", "/data/q.db"),
                ("PATCHFORGE_WORKERS", "2"),
                ("PATCHFORGE_STALE_TIMEOUT_SECS", "3600"),
                ("PATCHFORGE_MAX_ATTEMPTS", "4"),
                ("PATCHFORGE_VERIFY_COMMAND", "npm test"),
                ("OPENROUTER_API_KEY", "sk-or-fallback"),
            ]))
            .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/data/q.db"));
        assert_eq!(config.worker.num_workers, 2);
        assert_eq!(config.worker.stale_timeout, Duration::from_secs(3600));
        assert_eq!(config.repair.max_attempts, 4);
        assert_eq!(config.verify.command, "npm test");
        assert_eq!(config.require_api_key().unwrap(), "sk-or-fallback");
    }

    #[test]
    fn test_patchforge_key_wins_over_fallback() {
        let mut config = ForgeConfig::default();
        config
            .apply_env_with(env(&[
                ("PATCHFORGE_API_KEY", "sk-primary"),
                ("OPENROUTER_API_KEY", "sk-fallback"),
            ]))
            .unwrap();
        assert_eq!(config.fixers.api_key.as_deref(), Some("sk-primary"));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = ForgeConfig::default();
        let err = config
            .apply_env_with(env(&[("PATCHFORGE_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PATCHFORGE_WORKERS"));
    }

    #[test]
    fn test_missing_api_key() {
        let config = ForgeConfig::default();
        assert!(matches!(
            config.require_api_key(),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let mut config = ForgeConfig::default();
        config.repair.primary_attempts = 4;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(_))));

        let mut config = ForgeConfig::default();
        config.repair.max_attempts = 0;
        config.repair.primary_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ForgeConfig::default();
        config.worker.num_workers = 0;
        assert!(config.validate().is_err());

        let mut config = ForgeConfig::default();
        config.verify.command = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = ForgeConfig::default();
        config.worker.stale_timeout = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = ForgeConfig::default();
        config.rate_limits.default.capacity = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_timeout_covers_whole_attempt() {
        let config = ForgeConfig::default();
        // 2 x 900s verify + 4 calls x (120s limiter + 120s request) + 3 x 30s backoff
        assert_eq!(config.max_lock_gap(), Duration::from_secs(2850));
        assert!(config.worker.stale_timeout >= config.max_lock_gap());

        // Longer than the verify timeout alone is not enough.
        let mut config = ForgeConfig::default();
        config.worker.stale_timeout = Duration::from_secs(config.verify.timeout_secs * 2);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(_))));

        let mut config = ForgeConfig::default();
        config.repair.fixer_retries = 20;
        assert!(config.validate().is_err());
        config.worker.stale_timeout = config.max_lock_gap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let mut config = ForgeConfig::default();
        config.fixers.api_key = Some("sk-secret".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.yaml");
        std::fs::write(&path, "worker:\n  num_workers: 7\n").unwrap();

        let config = ForgeConfig::from_file(&path).unwrap();
        assert_eq!(config.worker.num_workers, 7);

        let err = ForgeConfig::from_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
