//! Status reconciliation: fold terminal backend results back into the ledger.

use std::collections::HashSet;

use rlfsm_core::{
  backend::OperationBackend,
  history::{CompletionRecord, History},
  inventory::Inventory,
  ledger::Ledger,
  subscription::{Direction, FailedAttempt, Status, Subscription},
  task::{Batch, OperationStatus, TaskId, TaskRecord, TaskResult, UNKNOWN_FAILURE},
};
use tracing::{debug, warn};

use crate::{Error, Result, Rlfsm};

impl<L, I, H, B> Rlfsm<L, I, H, B>
where
  L: Ledger,
  I: Inventory,
  H: History,
  B: OperationBackend,
{
  /// Settle every terminal result the backend reports for the open batches
  /// of `direction`. Returns the subscriptions that reached `done`.
  ///
  /// A batch whose results cannot be fetched is skipped until the next pass.
  /// Tasks of a batch the backend no longer reports at all are lost (a
  /// backend restart drops them) and their subscriptions go back to `retry`.
  /// Running this twice over the same results changes nothing the second
  /// time: the task row is gone, so the result is only forgotten again.
  pub(crate) async fn reconcile(&self, direction: Direction) -> Result<Vec<Subscription>> {
    let batches = self
      .ledger
      .batches(direction)
      .await
      .map_err(Error::ledger)?;

    let mut completed = Vec::new();
    for batch in batches {
      let results = match self
        .call_backend(
          direction,
          "get_results",
          self.backend(direction).get_results(batch.id),
        )
        .await
      {
        Ok(results) => results,
        Err(e) => {
          warn!(%direction, batch = batch.id, error = %e, "could not fetch batch results");
          continue;
        }
      };

      let reported: HashSet<TaskId> = results.iter().map(|r| r.task_id).collect();
      for result in results {
        if !result.status.is_terminal() {
          continue;
        }
        if let Some(done) = self.settle(direction, &batch, result).await? {
          completed.push(done);
        }
      }

      let lost: Vec<TaskRecord> = self
        .ledger
        .tasks(direction, batch.id)
        .await
        .map_err(Error::ledger)?
        .into_iter()
        .filter(|task| !reported.contains(&task.id))
        .collect();
      for task in lost {
        self.settle_lost(direction, task).await?;
      }

      self.drop_batch_if_empty(direction, batch.id).await?;
    }
    Ok(completed)
  }

  /// Fold one terminal result into the ledger. The history record is
  /// written only by the call whose status change wins, so a pass
  /// interrupted after the change does not archive the result twice.
  async fn settle(
    &self,
    direction: Direction,
    batch: &Batch,
    result: TaskResult,
  ) -> Result<Option<Subscription>> {
    let Some(task) = self
      .ledger
      .task(direction, result.task_id)
      .await
      .map_err(Error::ledger)?
    else {
      self.forget_result(direction, result.task_id).await;
      return Ok(None);
    };

    let subscription = self
      .ledger
      .subscription(direction, task.subscription_id)
      .await
      .map_err(Error::ledger)?;

    let exitcode = result.exitcode.unwrap_or(match result.status {
      OperationStatus::Done => 0,
      _ => UNKNOWN_FAILURE,
    });

    let mut completed = None;
    match subscription {
      None => warn!(%direction, task = task.id, "task without subscription"),
      Some(mut sub) => match sub.status {
        Status::InBatch => {
          let next = match result.status {
            OperationStatus::Done => Status::Done,
            _ => Status::Retry,
          };
          if result.status == OperationStatus::Failed
            && let Some(source) = &task.source
          {
            self
              .ledger
              .record_failure(FailedAttempt {
                subscription_id: sub.id,
                source_site:     source.clone(),
                exitcode,
              })
              .await
              .map_err(Error::ledger)?;
          }
          let moved = self
            .ledger
            .set_status(direction, sub.id, Status::InBatch, next)
            .await
            .map_err(Error::ledger)?;
          debug!(
            %direction,
            subscription = sub.id,
            task = task.id,
            result = %result.status,
            exitcode,
            to = %next,
            moved,
            "task settled"
          );
          if moved {
            self.archive(batch, &task, &sub, &result, exitcode).await?;
            if next == Status::Done {
              sub.status = Status::Done;
              completed = Some(sub);
            }
          }
        }
        Status::Cancelled => {
          self.delete_task(direction, task.id).await?;
          let removed = self
            .ledger
            .delete_subscription(direction, sub.id, Status::Cancelled)
            .await
            .map_err(Error::ledger)?;
          if removed {
            self.archive(batch, &task, &sub, &result, exitcode).await?;
          }
          debug!(%direction, subscription = sub.id, task = task.id, removed, "cancelled subscription removed");
        }
        other => {
          debug!(%direction, subscription = sub.id, task = task.id, status = %other, "result for subscription not in batch");
        }
      },
    }

    self.delete_task(direction, task.id).await?;
    self.forget_result(direction, task.id).await;
    Ok(completed)
  }

  /// Drop a task the backend has no record of. Nothing ran, so nothing is
  /// archived and no failure is recorded.
  async fn settle_lost(&self, direction: Direction, task: TaskRecord) -> Result<()> {
    let status = self
      .ledger
      .subscription(direction, task.subscription_id)
      .await
      .map_err(Error::ledger)?
      .map(|sub| sub.status);

    match status {
      Some(Status::InBatch) => {
        let moved = self
          .ledger
          .set_status(direction, task.subscription_id, Status::InBatch, Status::Retry)
          .await
          .map_err(Error::ledger)?;
        warn!(%direction, subscription = task.subscription_id, task = task.id, moved, "backend lost task; retrying");
      }
      Some(Status::Cancelled) => {
        self.delete_task(direction, task.id).await?;
        self
          .ledger
          .delete_subscription(direction, task.subscription_id, Status::Cancelled)
          .await
          .map_err(Error::ledger)?;
        debug!(%direction, subscription = task.subscription_id, task = task.id, "lost task of cancelled subscription dropped");
      }
      _ => {}
    }
    self.delete_task(direction, task.id).await?;
    Ok(())
  }

  async fn archive(
    &self,
    batch: &Batch,
    task: &TaskRecord,
    sub: &Subscription,
    result: &TaskResult,
    exitcode: i32,
  ) -> Result<()> {
    if self.settings.read_only {
      return Ok(());
    }
    let record = CompletionRecord {
      direction: sub.direction,
      file_name: sub.file.name.clone(),
      file_size: sub.file.size,
      source_site: task.source.clone(),
      site: sub.site.clone(),
      exitcode,
      batch_id: batch.id,
      created_at: task.created_at,
      started_at: result.started_at,
      finished_at: result.finished_at,
    };
    self
      .history
      .record_completion(record)
      .await
      .map_err(Error::history)
  }

  async fn delete_task(&self, direction: Direction, task_id: TaskId) -> Result<bool> {
    self
      .ledger
      .delete_task(direction, task_id)
      .await
      .map_err(Error::ledger)
  }

  async fn forget_result(&self, direction: Direction, task_id: TaskId) {
    if self.settings.read_only {
      return;
    }
    if let Err(e) = self
      .call_backend(
        direction,
        "forget_result",
        self.backend(direction).forget_result(task_id),
      )
      .await
    {
      warn!(%direction, task = task_id, error = %e, "could not forget result");
    }
  }
}
