//! Tasks and batches — the execution ledger.
//!
//! A task is one attempt at realising a subscription. It is bound to a batch
//! (and, for transfers, to a chosen source) and lives only as long as that
//! batch submission is outstanding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::subscription::{Direction, Subscription, SubscriptionId};

pub type TaskId = i64;
pub type BatchId = i64;

/// Exit code recorded when a task never reached the backend.
pub const SUBMISSION_FAILED: i32 = -1;

/// Exit code recorded when the backend reports a failure without one.
pub const UNKNOWN_FAILURE: i32 = -2;

// ─── In-memory task ──────────────────────────────────────────────────────────

/// A task as handed to an [`OperationBackend`](crate::backend::OperationBackend).
///
/// `id` and `batch_id` stay `None` until the task is persisted.
#[derive(Debug, Clone)]
pub struct Task {
  pub id:           Option<TaskId>,
  pub batch_id:     Option<BatchId>,
  pub subscription: Subscription,
  /// Chosen source site; always `None` for deletions.
  pub source:       Option<String>,
  pub created_at:   DateTime<Utc>,
}

impl Task {
  pub fn transfer(subscription: Subscription, source: String) -> Self {
    Self {
      id: None,
      batch_id: None,
      subscription,
      source: Some(source),
      created_at: Utc::now(),
    }
  }

  pub fn deletion(subscription: Subscription) -> Self {
    Self {
      id: None,
      batch_id: None,
      subscription,
      source: None,
      created_at: Utc::now(),
    }
  }

}

// ─── Persisted rows ──────────────────────────────────────────────────────────

/// Input to [`crate::ledger::Ledger::create_batch`].
#[derive(Debug, Clone)]
pub struct NewTask {
  pub subscription_id: SubscriptionId,
  pub source:          Option<String>,
  pub created_at:      DateTime<Utc>,
}

impl From<&Task> for NewTask {
  fn from(task: &Task) -> Self {
    Self {
      subscription_id: task.subscription.id,
      source:          task.source.clone(),
      created_at:      task.created_at,
    }
  }
}

/// A task row as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
  pub id:              TaskId,
  pub direction:       Direction,
  pub subscription_id: SubscriptionId,
  pub source:          Option<String>,
  pub batch_id:        BatchId,
  pub created_at:      DateTime<Utc>,
}

/// A batch row as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
  pub id:         BatchId,
  pub direction:  Direction,
  pub created_at: DateTime<Utc>,
}

// ─── Backend results ─────────────────────────────────────────────────────────

/// Status of a task as reported by the operation backend.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
  New,
  InProgress,
  Done,
  Failed,
  Cancelled,
}

impl OperationStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Done | Self::Failed | Self::Cancelled)
  }
}

/// One row of [`OperationBackend::get_results`](crate::backend::OperationBackend::get_results).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
  pub task_id:     TaskId,
  pub status:      OperationStatus,
  pub exitcode:    Option<i32>,
  pub started_at:  Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}
