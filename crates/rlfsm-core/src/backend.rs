//! The `OperationBackend` trait — the seam to the engines that actually move
//! or delete bytes.
//!
//! One backend instance serves transfers and another serves deletions; they
//! may share an implementation. The concrete type is chosen from configuration
//! at startup.

use std::{collections::HashMap, future::Future};

use crate::task::{BatchId, Task, TaskId, TaskResult};

/// Abstraction over a bulk file-operation service.
///
/// Individual submission failures are reported through the boolean map
/// returned by [`start`](Self::start), never through `Err`. `Err` means the
/// backend could not be reached at all.
pub trait OperationBackend: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Chunk `tasks` into batches. Tasks may be dropped; the caller logs the
  /// difference and picks the subscriptions up again on a later pass.
  fn form_batches(&self, tasks: Vec<Task>) -> Vec<Vec<Task>>;

  /// Submit one batch. The map holds `true` for every accepted task id; a
  /// missing entry counts as rejected.
  fn start<'a>(
    &'a self,
    batch_id: BatchId,
    tasks: &'a [Task],
  ) -> impl Future<Output = Result<HashMap<TaskId, bool>, Self::Error>> + Send + 'a;

  /// Current state of every task the backend still remembers in `batch_id`.
  fn get_results(
    &self,
    batch_id: BatchId,
  ) -> impl Future<Output = Result<Vec<TaskResult>, Self::Error>> + Send + '_;

  /// Ask the backend to stop the given tasks. Best-effort.
  fn cancel<'a>(
    &'a self,
    task_ids: &'a [TaskId],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// The caller has consumed the terminal result of `task_id`.
  fn forget_result(
    &self,
    task_id: TaskId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// The caller holds no more tasks in `batch_id`.
  fn forget_batch(
    &self,
    batch_id: BatchId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
