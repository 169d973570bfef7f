use std::path::PathBuf;

use crate::store::StoreDurability;

use super::{Config, ConfigLayer};

/// Later layers win over earlier ones; both sit on top of the defaults.
pub fn merge_layers(user: Option<ConfigLayer>, explicit: Option<ConfigLayer>) -> Config {
    let mut config = Config::default();
    if let Some(layer) = user {
        layer.apply_to(&mut config);
    }
    if let Some(layer) = explicit {
        layer.apply_to(&mut config);
    }
    config
}

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_with(config, |key| std::env::var(key).ok());
}

/// Applies `RTXN_*` overrides read through `lookup`. Blank values are ignored;
/// unparseable ones are logged and ignored.
pub fn apply_env_overrides_with(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = var("RTXN_STORE_PATH") {
        config.store.path = Some(PathBuf::from(raw));
    }

    if let Some(raw) = var("RTXN_STORE_DURABILITY") {
        match StoreDurability::parse(&raw) {
            Some(durability) => config.store.durability = durability,
            None => tracing::warn!("invalid RTXN_STORE_DURABILITY {raw:?}, ignoring"),
        }
    }

    if let Some(raw) = var("RTXN_STORE_IN_MEMORY") {
        match raw.parse::<bool>() {
            Ok(value) => config.store.in_memory = value,
            Err(err) => tracing::warn!("invalid RTXN_STORE_IN_MEMORY, ignoring: {err}"),
        }
    }

    if let Some(raw) = var("RTXN_COMMIT_TIMEOUT_MS") {
        match raw.parse::<u64>() {
            Ok(value) => config.coordinator.commit_timeout_ms = value,
            Err(err) => tracing::warn!("invalid RTXN_COMMIT_TIMEOUT_MS, ignoring: {err}"),
        }
    }

    if let Some(raw) = var("RTXN_SESSION_RETENTION_MS") {
        match raw.parse::<u64>() {
            Ok(value) => config.coordinator.session_history_retention_ms = value,
            Err(err) => tracing::warn!("invalid RTXN_SESSION_RETENTION_MS, ignoring: {err}"),
        }
    }

    if let Some(raw) = var("RTXN_TERM") {
        match raw.parse::<u64>() {
            Ok(value) => config.coordinator.term = value,
            Err(err) => tracing::warn!("invalid RTXN_TERM, ignoring: {err}"),
        }
    }

    if let Some(raw) = var("RTXN_LOG_FILTER") {
        config.logging.filter = Some(raw);
    }
}
