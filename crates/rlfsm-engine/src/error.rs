//! Error type for `rlfsm-engine`.

use std::time::Duration;

use rlfsm_core::subscription::Direction;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("ledger error: {0}")]
  Ledger(#[source] BoxError),

  #[error("inventory error: {0}")]
  Inventory(#[source] BoxError),

  #[error("history error: {0}")]
  History(#[source] BoxError),

  #[error("{direction} backend failed in {operation}: {source}")]
  Backend {
    direction: Direction,
    operation: &'static str,
    #[source]
    source:    BoxError,
  },

  #[error("{direction} backend timed out in {operation} after {after:?}")]
  Timeout {
    direction: Direction,
    operation: &'static str,
    after:     Duration,
  },
}

impl Error {
  pub(crate) fn ledger(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Ledger(Box::new(e))
  }

  pub(crate) fn inventory(
    e: impl std::error::Error + Send + Sync + 'static,
  ) -> Self {
    Self::Inventory(Box::new(e))
  }

  pub(crate) fn history(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::History(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
