//! Daemon configuration, deserialised from `rlfsm.toml` and `RLFSM_*`
//! environment variables.
//!
//! Nested keys use `__` in the environment, e.g.
//! `RLFSM_TRANSFER_BACKEND__BATCH_SIZE=50`.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use config::{
  Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState,
};
use rlfsm_engine::{Settings, dummy::DummyOptions};
use serde::Deserialize;

// ─── Daemon ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Ledger database; also holds the inventory tables.
  pub store_path:             PathBuf,
  pub history_path:           PathBuf,
  pub interval_secs:          u64,
  pub backend_timeout_secs:   u64,
  pub read_only:              bool,
  pub missing_file_exitcodes: Vec<i32>,
  pub transfer_backend:       BackendConfig,
  pub deletion_backend:       BackendConfig,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    let settings = Settings::default();
    Self {
      store_path:             PathBuf::from("rlfsm.sqlite3"),
      history_path:           PathBuf::from("rlfsm-history.sqlite3"),
      interval_secs:          settings.interval.as_secs(),
      backend_timeout_secs:   settings.backend_timeout.as_secs(),
      read_only:              settings.read_only,
      missing_file_exitcodes: settings.missing_file_exitcodes,
      transfer_backend:       BackendConfig::default(),
      deletion_backend:       BackendConfig::default(),
    }
  }
}

impl DaemonConfig {
  /// Read `path` if it exists, then overlay the environment.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    Self::from_builder(Config::builder().add_source(File::from(path).required(false)))
  }

  pub(crate) fn from_builder(
    builder: ConfigBuilder<DefaultState>,
  ) -> Result<Self, ConfigError> {
    builder
      .add_source(
        Environment::with_prefix("RLFSM")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true)
          .list_separator(",")
          .with_list_parse_key("missing_file_exitcodes"),
      )
      .build()?
      .try_deserialize()
  }

  pub fn settings(&self) -> Settings {
    Settings {
      interval:               Duration::from_secs(self.interval_secs),
      backend_timeout:        Duration::from_secs(self.backend_timeout_secs),
      read_only:              self.read_only,
      missing_file_exitcodes: self.missing_file_exitcodes.clone(),
    }
  }
}

// ─── Backends ────────────────────────────────────────────────────────────────

/// Which operation backend serves a direction, and its options.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
  Dummy(DummyConfig),
}

impl Default for BackendConfig {
  fn default() -> Self { Self::Dummy(DummyConfig::default()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DummyConfig {
  pub batch_size: usize,
  pub accept:     bool,
  pub exitcode:   i32,
}

impl Default for DummyConfig {
  fn default() -> Self {
    let options = DummyOptions::default();
    Self {
      batch_size: options.batch_size,
      accept:     options.accept,
      exitcode:   options.exitcode,
    }
  }
}

impl From<&DummyConfig> for DummyOptions {
  fn from(config: &DummyConfig) -> Self {
    Self {
      batch_size: config.batch_size,
      accept:     config.accept,
      exitcode:   config.exitcode,
    }
  }
}
