//! Batch submission: persist a formed batch, hand it to the backend, and
//! record which tasks it took.

use std::collections::HashMap;

use rlfsm_core::{
  backend::OperationBackend,
  history::History,
  inventory::Inventory,
  ledger::Ledger,
  subscription::{Direction, FailedAttempt, Status},
  task::{BatchId, NewTask, SUBMISSION_FAILED, Task},
};
use tracing::{debug, info, warn};

use crate::{Error, Result, Rlfsm};

impl<L, I, H, B> Rlfsm<L, I, H, B>
where
  L: Ledger,
  I: Inventory,
  H: History,
  B: OperationBackend,
{
  /// Submit one formed batch. Returns `(accepted, rejected)`.
  ///
  /// A backend that cannot be reached, or does not answer in time, rejects
  /// every task. Rejected transfers go back to `retry` with a
  /// [`SUBMISSION_FAILED`] attempt recorded against their source; rejected
  /// deletions are held.
  pub(crate) async fn submit(
    &self,
    direction: Direction,
    mut tasks: Vec<Task>,
  ) -> Result<(usize, usize)> {
    if tasks.is_empty() {
      return Ok((0, 0));
    }
    if self.settings.read_only {
      for task in &tasks {
        info!(
          %direction,
          subscription = task.subscription.id,
          file = %task.subscription.file.name,
          site = %task.subscription.site,
          source = ?task.source,
          "read-only: would submit"
        );
      }
      return Ok((0, 0));
    }

    let new_tasks = tasks.iter().map(NewTask::from).collect();
    let (batch, records) = self
      .ledger
      .create_batch(direction, new_tasks)
      .await
      .map_err(Error::ledger)?;
    for (task, record) in tasks.iter_mut().zip(&records) {
      task.id = Some(record.id);
      task.batch_id = Some(batch.id);
    }

    let accepted = match self
      .call_backend(
        direction,
        "start",
        self.backend(direction).start(batch.id, &tasks),
      )
      .await
    {
      Ok(accepted) => accepted,
      Err(e) => {
        warn!(%direction, batch = batch.id, error = %e, "batch submission failed");
        HashMap::new()
      }
    };

    let (mut ok, mut rejected) = (0, 0);
    for task in &tasks {
      let Some(task_id) = task.id else { continue };
      let sub = &task.subscription;

      if accepted.get(&task_id).copied().unwrap_or(false) {
        // A concurrent cancel wins the CAS; the stale-cancel phase then
        // withdraws the task.
        let flipped = self
          .ledger
          .set_status(direction, sub.id, sub.status, Status::InBatch)
          .await
          .map_err(Error::ledger)?;
        if !flipped {
          debug!(%direction, subscription = sub.id, task = task_id, "subscription changed during submission");
        }
        ok += 1;
        continue;
      }

      rejected += 1;
      self
        .ledger
        .delete_task(direction, task_id)
        .await
        .map_err(Error::ledger)?;
      let next = match direction {
        Direction::Transfer => {
          if let Some(source) = &task.source {
            self
              .ledger
              .record_failure(FailedAttempt {
                subscription_id: sub.id,
                source_site:     source.clone(),
                exitcode:        SUBMISSION_FAILED,
              })
              .await
              .map_err(Error::ledger)?;
          }
          Status::Retry
        }
        Direction::Deletion => Status::Held,
      };
      self
        .ledger
        .set_status(direction, sub.id, sub.status, next)
        .await
        .map_err(Error::ledger)?;
      debug!(%direction, subscription = sub.id, task = task_id, to = %next, "task rejected");
    }

    self.drop_batch_if_empty(direction, batch.id).await?;

    info!(%direction, batch = batch.id, accepted = ok, rejected, "batch submitted");
    Ok((ok, rejected))
  }

  /// Delete `batch_id` once no task references it and let the backend drop
  /// it too. Returns whether the batch went.
  pub(crate) async fn drop_batch_if_empty(
    &self,
    direction: Direction,
    batch_id: BatchId,
  ) -> Result<bool> {
    let deleted = self
      .ledger
      .delete_batch_if_empty(direction, batch_id)
      .await
      .map_err(Error::ledger)?;
    if deleted
      && !self.settings.read_only
      && let Err(e) = self
        .call_backend(
          direction,
          "forget_batch",
          self.backend(direction).forget_batch(batch_id),
        )
        .await
    {
      warn!(%direction, batch = batch_id, error = %e, "could not forget batch");
    }
    Ok(deleted)
  }
}
