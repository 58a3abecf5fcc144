//! The reliable file-operation state machine (RLFSM).
//!
//! [`Rlfsm`] turns persisted subscriptions into batched, retried transfer and
//! deletion tasks. It is generic over its collaborators:
//!
//! - a [`Ledger`] holding subscriptions, tasks and batches,
//! - an [`Inventory`] answering where replicas live,
//! - a [`History`] archive for completed operations,
//! - one [`OperationBackend`] per direction.
//!
//! The engine is the only writer of task and batch rows. Subscriptions may be
//! created concurrently by other processes through the ledger.
//!
//! ```rust,ignore
//! let engine = Rlfsm::new(ledger, inventory, history, transfer, deletion, Settings::default());
//! let (stop, stop_rx) = tokio::sync::watch::channel(false);
//! engine.run(stop_rx).await;
//! ```

pub mod dummy;
pub mod error;

mod cycle;
mod reconciler;
mod selector;
mod submitter;
mod subscriptions;

use std::{future::Future, sync::Arc, time::Duration};

use rlfsm_core::{
  backend::OperationBackend, history::History, inventory::Inventory,
  ledger::Ledger, subscription::Direction,
};

pub use cycle::{DriverState, PassSummary};
pub use error::{Error, Result};
pub use selector::select_source;

// ─── Settings ────────────────────────────────────────────────────────────────

/// Tunables for the cycle driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
  /// Sleep between two passes.
  pub interval:               Duration,
  /// Deadline applied to every backend call.
  pub backend_timeout:        Duration,
  /// Compute and log, but never submit, cancel, forget or archive.
  pub read_only:              bool,
  /// Exit codes meaning "file missing at the source site".
  pub missing_file_exitcodes: Vec<i32>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      interval:               Duration::from_secs(30),
      backend_timeout:        Duration::from_secs(300),
      read_only:              false,
      missing_file_exitcodes: vec![2],
    }
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

pub struct Rlfsm<L, I, H, B> {
  ledger:    Arc<L>,
  inventory: Arc<I>,
  history:   Arc<H>,
  transfer:  B,
  deletion:  B,
  settings:  Settings,
}

impl<L, I, H, B> Rlfsm<L, I, H, B>
where
  L: Ledger,
  I: Inventory,
  H: History,
  B: OperationBackend,
{
  pub fn new(
    ledger: Arc<L>,
    inventory: Arc<I>,
    history: Arc<H>,
    transfer: B,
    deletion: B,
    settings: Settings,
  ) -> Self {
    Self { ledger, inventory, history, transfer, deletion, settings }
  }

  pub fn settings(&self) -> &Settings { &self.settings }

  pub fn ledger(&self) -> &L { &self.ledger }

  /// The backend serving `direction`.
  pub fn backend(&self, direction: Direction) -> &B {
    match direction {
      Direction::Transfer => &self.transfer,
      Direction::Deletion => &self.deletion,
    }
  }

  /// Await a backend call under the configured deadline.
  async fn call_backend<T, E, F>(
    &self,
    direction: Direction,
    operation: &'static str,
    call: F,
  ) -> Result<T>
  where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
  {
    let after = self.settings.backend_timeout;
    match tokio::time::timeout(after, call).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => Err(Error::Backend {
        direction,
        operation,
        source: Box::new(e),
      }),
      Err(_) => Err(Error::Timeout { direction, operation, after }),
    }
  }
}

#[cfg(test)]
mod tests;
