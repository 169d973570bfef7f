use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::{CommitOptions, CoordinatorOptions};
use crate::retry::RetryOptions;
use crate::store::StoreDurability;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub coordinator: CoordinatorConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            term: self.coordinator.term,
        }
    }

    pub fn commit_options(&self) -> CommitOptions {
        CommitOptions {
            timeout: Duration::from_millis(self.coordinator.commit_timeout_ms),
            backoff_base: Duration::from_millis(self.coordinator.participant_backoff_base_ms),
            backoff_max: Duration::from_millis(self.coordinator.participant_backoff_max_ms),
        }
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_statements_per_request: self.limits.max_statements_per_request,
            max_operation_bytes: self.limits.max_operation_bytes,
            session_history_retention: Duration::from_millis(
                self.coordinator.session_history_retention_ms,
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `sessions.sqlite`. `None` uses the data dir.
    pub path: Option<PathBuf>,
    pub durability: StoreDurability,
    /// Keep session state in memory only.
    pub in_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub commit_timeout_ms: u64,
    pub participant_backoff_base_ms: u64,
    pub participant_backoff_max_ms: u64,
    pub session_history_retention_ms: u64,
    pub term: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            commit_timeout_ms: 30_000,
            participant_backoff_base_ms: 10,
            participant_backoff_max_ms: 1_000,
            session_history_retention_ms: 30 * 60 * 1_000,
            term: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_statements_per_request: usize,
    pub max_operation_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let defaults = RetryOptions::default();
        Self {
            max_statements_per_request: defaults.max_statements_per_request,
            max_operation_bytes: defaults.max_operation_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}

// =============================================================================
// Layers
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub store: StoreConfigOverride,
    pub coordinator: CoordinatorConfigOverride,
    pub limits: LimitsConfigOverride,
    pub logging: LoggingConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.store.apply_to(&mut base.store);
        self.coordinator.apply_to(&mut base.coordinator);
        self.limits.apply_to(&mut base.limits);
        self.logging.apply_to(&mut base.logging);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfigOverride {
    pub path: Option<PathBuf>,
    pub durability: Option<StoreDurability>,
    pub in_memory: Option<bool>,
}

impl StoreConfigOverride {
    pub fn apply_to(&self, target: &mut StoreConfig) {
        if let Some(path) = self.path.as_ref() {
            target.path = Some(path.clone());
        }
        if let Some(durability) = self.durability {
            target.durability = durability;
        }
        if let Some(in_memory) = self.in_memory {
            target.in_memory = in_memory;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfigOverride {
    pub commit_timeout_ms: Option<u64>,
    pub participant_backoff_base_ms: Option<u64>,
    pub participant_backoff_max_ms: Option<u64>,
    pub session_history_retention_ms: Option<u64>,
    pub term: Option<u64>,
}

impl CoordinatorConfigOverride {
    pub fn apply_to(&self, target: &mut CoordinatorConfig) {
        if let Some(value) = self.commit_timeout_ms {
            target.commit_timeout_ms = value;
        }
        if let Some(value) = self.participant_backoff_base_ms {
            target.participant_backoff_base_ms = value;
        }
        if let Some(value) = self.participant_backoff_max_ms {
            target.participant_backoff_max_ms = value;
        }
        if let Some(value) = self.session_history_retention_ms {
            target.session_history_retention_ms = value;
        }
        if let Some(value) = self.term {
            target.term = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LimitsConfigOverride {
    pub max_statements_per_request: Option<usize>,
    pub max_operation_bytes: Option<usize>,
}

impl LimitsConfigOverride {
    pub fn apply_to(&self, target: &mut LimitsConfig) {
        if let Some(value) = self.max_statements_per_request {
            target.max_statements_per_request = value;
        }
        if let Some(value) = self.max_operation_bytes {
            target.max_operation_bytes = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(days) = self.retention_max_age_days {
            target.retention_max_age_days = Some(days);
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_layer_only_touches_named_fields() {
        let layer: ConfigLayer = toml::from_str(
            r#"
            [coordinator]
            commit_timeout_ms = 500

            [logging.file]
            enabled = true
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        layer.apply_to(&mut config);
        assert_eq!(config.coordinator.commit_timeout_ms, 500);
        assert_eq!(config.coordinator.participant_backoff_base_ms, 10);
        assert!(config.logging.file.enabled);
        assert_eq!(config.logging.file.format, LogFormat::Json);
        assert_eq!(config.commit_options().timeout, Duration::from_millis(500));
    }

    #[test]
    fn durability_parses_from_toml() {
        let layer: ConfigLayer = toml::from_str(
            r#"
            [store]
            durability = "cache"
            path = "/var/lib/rtxn"
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        layer.apply_to(&mut config);
        assert_eq!(config.store.durability, StoreDurability::Cache);
        assert_eq!(config.store.path, Some(PathBuf::from("/var/lib/rtxn")));
    }
}
