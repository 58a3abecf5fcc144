//! [`DummyBackend`] — an in-process operation backend that completes every
//! task it is given without touching any storage.
//!
//! Useful for dry runs of a new deployment and for exercising the cycle end
//! to end. Tasks finish on the first [`get_results`] call after submission.
//!
//! [`get_results`]: OperationBackend::get_results

use std::{
  collections::HashMap,
  convert::Infallible,
  sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use rlfsm_core::{
  backend::OperationBackend,
  task::{BatchId, OperationStatus, Task, TaskId, TaskResult},
};
use tracing::debug;

/// Behaviour of a [`DummyBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyOptions {
  /// Largest batch [`form_batches`](OperationBackend::form_batches) returns.
  pub batch_size: usize,
  /// Accept every submitted task; `false` rejects them all.
  pub accept:     bool,
  /// Exit code every task finishes with. `0` means done, anything else
  /// failed.
  pub exitcode:   i32,
}

impl Default for DummyOptions {
  fn default() -> Self {
    Self { batch_size: 100, accept: true, exitcode: 0 }
  }
}

#[derive(Debug, Default)]
pub struct DummyBackend {
  options: DummyOptions,
  batches: Mutex<HashMap<BatchId, Vec<TaskResult>>>,
}

impl DummyBackend {
  pub fn new(options: DummyOptions) -> Self {
    Self { options, batches: Mutex::default() }
  }

  pub fn options(&self) -> &DummyOptions { &self.options }

  fn batches(&self) -> MutexGuard<'_, HashMap<BatchId, Vec<TaskResult>>> {
    self.batches.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl OperationBackend for DummyBackend {
  type Error = Infallible;

  fn form_batches(&self, tasks: Vec<Task>) -> Vec<Vec<Task>> {
    let size = self.options.batch_size.max(1);
    let mut batches = Vec::with_capacity(tasks.len().div_ceil(size));
    let mut tasks = tasks.into_iter().peekable();
    while tasks.peek().is_some() {
      batches.push(tasks.by_ref().take(size).collect());
    }
    batches
  }

  async fn start(
    &self,
    batch_id: BatchId,
    tasks: &[Task],
  ) -> Result<HashMap<TaskId, bool>, Infallible> {
    let ids: Vec<TaskId> = tasks.iter().filter_map(|t| t.id).collect();
    if self.options.accept {
      self.batches().entry(batch_id).or_default().extend(ids.iter().map(
        |&task_id| TaskResult {
          task_id,
          status: OperationStatus::New,
          exitcode: None,
          started_at: None,
          finished_at: None,
        },
      ));
    }
    debug!(batch = batch_id, tasks = ids.len(), accept = self.options.accept, "dummy batch started");
    Ok(ids.into_iter().map(|id| (id, self.options.accept)).collect())
  }

  async fn get_results(&self, batch_id: BatchId) -> Result<Vec<TaskResult>, Infallible> {
    let now = Utc::now();
    let mut batches = self.batches();
    let Some(results) = batches.get_mut(&batch_id) else {
      return Ok(Vec::new());
    };
    for result in results.iter_mut().filter(|r| !r.status.is_terminal()) {
      result.status = if self.options.exitcode == 0 {
        OperationStatus::Done
      } else {
        OperationStatus::Failed
      };
      result.exitcode = Some(self.options.exitcode);
      result.started_at = Some(now);
      result.finished_at = Some(now);
    }
    Ok(results.clone())
  }

  async fn cancel(&self, task_ids: &[TaskId]) -> Result<(), Infallible> {
    let now = Utc::now();
    for result in self.batches().values_mut().flatten() {
      if task_ids.contains(&result.task_id) && !result.status.is_terminal() {
        result.status = OperationStatus::Cancelled;
        result.finished_at = Some(now);
      }
    }
    Ok(())
  }

  async fn forget_result(&self, task_id: TaskId) -> Result<(), Infallible> {
    for results in self.batches().values_mut() {
      results.retain(|r| r.task_id != task_id);
    }
    Ok(())
  }

  async fn forget_batch(&self, batch_id: BatchId) -> Result<(), Infallible> {
    self.batches().remove(&batch_id);
    Ok(())
  }
}
