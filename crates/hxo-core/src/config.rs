//! Configuration management for HXO
//!
//! Tunables are read from `.hxo/config.toml` in the working root, then
//! overridden by `HXO_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{HxoError, Result};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HxoConfig {
    /// Submissions are rejected when false
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Global cap on in-flight shard executions
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Fallback timeout for stages without an SLO
    #[serde(default = "default_shard_timeout_ms")]
    pub shard_timeout_ms: u64,

    /// Attempts per shard before it fails permanently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Fail remaining pending shards on the first permanent failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Proofs verified during certification
    #[serde(default = "default_certify_sample_size")]
    pub certify_sample_size: usize,

    /// Write attempts before a checkpoint error halts the control loop
    #[serde(default = "default_checkpoint_retries")]
    pub checkpoint_retries: usize,

    #[serde(default)]
    pub autosplit: AutosplitConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Hot-shard detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutosplitConfig {
    /// Rolling p95 threshold; 0 disables autosplit
    #[serde(default = "default_autosplit_p95_ms")]
    pub p95_ms: u64,

    #[serde(default = "default_autosplit_factor")]
    pub factor: u32,

    #[serde(default = "default_autosplit_window")]
    pub window: usize,

    #[serde(default = "default_autosplit_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_autosplit_max_generations")]
    pub max_generations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Bearer token required on privileged routes when set
    #[serde(default)]
    pub admin_token: Option<String>,
}

// Default value providers
fn default_enabled() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    8
}

fn default_shard_timeout_ms() -> u64 {
    120_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    5_000
}

fn default_certify_sample_size() -> usize {
    16
}

fn default_checkpoint_retries() -> usize {
    3
}

fn default_autosplit_p95_ms() -> u64 {
    30_000
}

fn default_autosplit_factor() -> u32 {
    2
}

fn default_autosplit_window() -> usize {
    64
}

fn default_autosplit_min_samples() -> usize {
    16
}

fn default_autosplit_max_generations() -> u32 {
    3
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".hxo/checkpoints.db")
}

fn default_bind() -> String {
    "127.0.0.1:8090".to_string()
}

impl Default for HxoConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_concurrency: default_max_concurrency(),
            shard_timeout_ms: default_shard_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            fail_fast: false,
            certify_sample_size: default_certify_sample_size(),
            checkpoint_retries: default_checkpoint_retries(),
            autosplit: AutosplitConfig::default(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for AutosplitConfig {
    fn default() -> Self {
        Self {
            p95_ms: default_autosplit_p95_ms(),
            factor: default_autosplit_factor(),
            window: default_autosplit_window(),
            min_samples: default_autosplit_min_samples(),
            max_generations: default_autosplit_max_generations(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            admin_token: None,
        }
    }
}

impl AutosplitConfig {
    pub fn enabled(&self) -> bool {
        self.p95_ms > 0 && self.factor > 1
    }
}

impl HxoConfig {
    /// Config path relative to a root directory
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(".hxo").join("config.toml")
    }

    /// Load from `.hxo/config.toml` under `root`, falling back to defaults,
    /// then apply environment overrides
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = Self::path_in(root);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str(&content)
                .map_err(|e| HxoError::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to `.hxo/config.toml` under `root`
    pub fn save(&self, root: &Path) -> Result<PathBuf> {
        let path = Self::path_in(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| HxoError::Config(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Apply `HXO_*` overrides from a lookup function
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| HxoError::Config(format!("{} has invalid value '{}'", key, raw)))
        }

        if let Some(v) = lookup("HXO_ENABLED") {
            self.enabled = parse("HXO_ENABLED", v)?;
        }
        if let Some(v) = lookup("HXO_MAX_CONCURRENCY") {
            self.max_concurrency = parse("HXO_MAX_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("HXO_SHARD_TIMEOUT_MS") {
            self.shard_timeout_ms = parse("HXO_SHARD_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("HXO_AUTOSPLIT_P95_MS") {
            self.autosplit.p95_ms = parse("HXO_AUTOSPLIT_P95_MS", v)?;
        }
        if let Some(v) = lookup("HXO_AUTOSPLIT_FACTOR") {
            self.autosplit.factor = parse("HXO_AUTOSPLIT_FACTOR", v)?;
        }
        if let Some(v) = lookup("HXO_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(HxoError::Config("max_concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(HxoError::Config("max_attempts must be at least 1".into()));
        }
        if self.shard_timeout_ms == 0 {
            return Err(HxoError::Config("shard_timeout_ms must be positive".into()));
        }
        if self.autosplit.window < self.autosplit.min_samples {
            return Err(HxoError::Config(
                "autosplit.window must hold at least min_samples".into(),
            ));
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_backoff_ms(mut self, base_ms: u64) -> Self {
        self.retry_backoff_ms = base_ms;
        self
    }

    pub fn with_autosplit(mut self, autosplit: AutosplitConfig) -> Self {
        self.autosplit = autosplit;
        self
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HxoConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.shard_timeout_ms, 120_000);
        assert_eq!(config.autosplit.factor, 2);
        assert!(config.autosplit.enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = HxoConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.max_attempts, 3);
        assert_eq!(loaded.certify_sample_size, 16);
    }

    #[test]
    fn test_partial_toml() {
        let toml_str = r#"
max_concurrency = 2

[autosplit]
p95_ms = 0
"#;
        let config: HxoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.max_attempts, 3);
        assert!(!config.autosplit.enabled());
        assert_eq!(config.autosplit.window, 64);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let config = HxoConfig::default().with_max_concurrency(3);
        let path = config.save(dir.path()).unwrap();
        assert!(path.ends_with(".hxo/config.toml"));

        let content = std::fs::read_to_string(path).unwrap();
        let reloaded: HxoConfig = toml::from_str(&content).unwrap();
        assert_eq!(reloaded.max_concurrency, 3);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HxoConfig::default();
        config
            .apply_env(|key| match key {
                "HXO_MAX_CONCURRENCY" => Some("16".to_string()),
                "HXO_ENABLED" => Some("false".to_string()),
                "HXO_STORE_PATH" => Some("/tmp/hxo.db".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_concurrency, 16);
        assert!(!config.enabled);
        assert_eq!(config.store.path, PathBuf::from("/tmp/hxo.db"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = HxoConfig::default();
        let err = config
            .apply_env(|key| (key == "HXO_AUTOSPLIT_FACTOR").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, HxoError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = HxoConfig::default().with_max_concurrency(0);
        assert!(config.validate().is_err());
    }
}
