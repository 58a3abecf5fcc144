//! `rlfsmd` — runs the RLFSM cycle against a SQLite ledger and the
//! operation backends named in configuration.

pub mod backend;
pub mod config;

pub use backend::{BackendError, ConfiguredBackend};
pub use config::{BackendConfig, DaemonConfig, DummyConfig};
