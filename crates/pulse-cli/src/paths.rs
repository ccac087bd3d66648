//! Default on-disk locations.
//!
//! `PULSE_DATA_DIR` wins, then `data_dir` from the config file, then the
//! platform data directory.

use std::path::PathBuf;

use directories::ProjectDirs;
use pulse_core::config::{PulseConfig, ENV_DATA_DIR};

/// Directory holding `config.toml` when no override is set.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(dir);
    }
    ProjectDirs::from("dev", "pulse", "pulse")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".pulse"))
}

pub fn config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

pub fn db_path(config: &PulseConfig) -> PathBuf {
    config
        .data_dir
        .clone()
        .unwrap_or_else(default_data_dir)
        .join("pulse.db")
}
