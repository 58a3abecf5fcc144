//! Error types for `rlfsm-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown subscription status: {0:?}")]
  UnknownStatus(String),

  #[error("unknown direction: {0:?}")]
  UnknownDirection(String),

  #[error("unknown storage class: {0:?}")]
  UnknownStorageClass(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
