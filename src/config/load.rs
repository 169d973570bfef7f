use std::fs;
use std::path::{Path, PathBuf};

use super::merge::{apply_env_overrides, merge_layers};
use super::{Config, ConfigError, ConfigLayer};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load_user_config() -> Result<Option<ConfigLayer>, ConfigError> {
    load_layer(&config_path())
}

/// Reads one layer from `path`. A missing file is not an error.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Defaults, then the user config, then `explicit`, then `RTXN_*` env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let user = load_user_config()?;
    let explicit = match explicit {
        Some(path) => load_layer(path)?,
        None => None,
    };
    let mut config = merge_layers(user, explicit);
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn load_or_init() -> Config {
    let path = config_path();
    let had_user_config = path.exists();

    let config = match load(None) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    };

    if !had_user_config && let Err(e) = write_config(&path, &Config::default()) {
        tracing::warn!("failed to write default config: {e}");
    }

    config
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::NoParent {
        path: path.to_path_buf(),
    })?;
    fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
        path: dir.to_path_buf(),
        source,
    })?;
    let contents = toml::to_string_pretty(cfg)?;
    atomic_write(dir, path, contents.as_bytes())
}

fn atomic_write(dir: &Path, path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    fs::write(temp.path(), data).map_err(write_err)?;
    temp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{LogFormat, LogRotation};
    use crate::store::StoreDurability;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.store.path = Some(PathBuf::from("/tmp/rtxn-store"));
        cfg.store.durability = StoreDurability::Cache;
        cfg.coordinator.commit_timeout_ms = 1_500;
        cfg.limits.max_statements_per_request = 64;
        cfg.logging.stdout = false;
        cfg.logging.stdout_format = LogFormat::Compact;
        cfg.logging.file.enabled = true;
        cfg.logging.file.rotation = LogRotation::Hourly;
        cfg.logging.file.retention_max_files = Some(3);

        write_config(&path, &cfg).expect("write config");
        let layer = load_layer(&path).expect("load").expect("layer present");
        let loaded = merge_layers(None, Some(layer));

        assert_eq!(loaded.store.path, cfg.store.path);
        assert_eq!(loaded.store.durability, StoreDurability::Cache);
        assert_eq!(loaded.coordinator.commit_timeout_ms, 1_500);
        assert_eq!(loaded.limits.max_statements_per_request, 64);
        assert!(!loaded.logging.stdout);
        assert_eq!(loaded.logging.stdout_format, LogFormat::Compact);
        assert!(loaded.logging.file.enabled);
        assert_eq!(loaded.logging.file.rotation, LogRotation::Hourly);
        assert_eq!(loaded.logging.file.retention_max_files, Some(3));
    }

    #[test]
    fn missing_layer_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_layer(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn malformed_layer_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[coordinator\ncommit_timeout_ms = ").unwrap();
        let err = load_layer(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }
}
