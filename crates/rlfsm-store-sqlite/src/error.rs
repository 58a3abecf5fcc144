//! Error type for `rlfsm-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] rlfsm_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("negative size {size} recorded for file {file:?}")]
  NegativeSize { file: String, size: i64 },

  #[error("transfer task {0} has no source site")]
  MissingSource(i64),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
