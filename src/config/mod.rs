//! Config loading and persistence.

mod load;
mod merge;
mod schema;

use std::path::PathBuf;

use thiserror::Error;

pub use load::{config_path, load, load_layer, load_or_init, load_user_config, write_config};
pub use merge::{apply_env_overrides, apply_env_overrides_with, merge_layers};
pub use schema::{
    Config, ConfigLayer, CoordinatorConfig, CoordinatorConfigOverride, FileLoggingConfig,
    FileLoggingConfigOverride, LimitsConfig, LimitsConfigOverride, LogFormat, LogRotation,
    LoggingConfig, LoggingConfigOverride, StoreConfig, StoreConfigOverride,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config path {path} has no parent directory")]
    NoParent { path: PathBuf },
}
