//! The cycle driver: one pass per direction, then an interruptible sleep.

use std::collections::BTreeSet;

use rlfsm_core::{
  backend::OperationBackend,
  history::History,
  inventory::Inventory,
  ledger::Ledger,
  subscription::{DirCleanupCandidate, Direction, Status, Subscription},
  task::{Task, TaskId},
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::{Error, Result, Rlfsm, selector::select_source};

/// Whether the driver should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
  Running,
  Stopped,
}

impl DriverState {
  /// Read the stop signal. `true` on the channel means stop.
  pub fn of(stop: &watch::Receiver<bool>) -> Self {
    if *stop.borrow() { Self::Stopped } else { Self::Running }
  }
}

/// Counters for one direction of one pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
  /// Unconfirmed tasks withdrawn from a previous, interrupted submission.
  pub recovered: usize,
  /// Tasks of cancelled subscriptions asked to stop.
  pub cancelled: usize,
  /// Subscriptions that reached `done`.
  pub completed: usize,
  /// Tasks the backend accepted.
  pub submitted: usize,
  /// Tasks the backend rejected.
  pub rejected:  usize,
  /// Tasks `form_batches` left out.
  pub dropped:   usize,
}

impl<L, I, H, B> Rlfsm<L, I, H, B>
where
  L: Ledger,
  I: Inventory,
  H: History,
  B: OperationBackend,
{
  /// Run passes until `stop` carries `true` or its sender goes away.
  ///
  /// A pass that fails (ledger or inventory unreachable) is logged and the
  /// next one starts after the usual sleep.
  pub async fn run(&self, mut stop: watch::Receiver<bool>) {
    info!(
      interval = ?self.settings.interval,
      read_only = self.settings.read_only,
      "cycle driver running"
    );
    while DriverState::of(&stop) == DriverState::Running {
      if let Err(e) = self.run_pass(&stop).await {
        error!(error = %e, "pass aborted");
      }

      tokio::select! {
        _ = tokio::time::sleep(self.settings.interval) => {}
        changed = stop.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }
    info!("cycle driver stopped");
  }

  /// One pass over both directions, ignoring any stop signal.
  pub async fn run_once(&self) -> Result<Vec<(Direction, PassSummary)>> {
    let (_stop, stop_rx) = watch::channel(false);
    self.run_pass(&stop_rx).await
  }

  /// One pass over both directions, transfers first. `stop` is checked
  /// between phases.
  pub async fn run_pass(
    &self,
    stop: &watch::Receiver<bool>,
  ) -> Result<Vec<(Direction, PassSummary)>> {
    let mut summaries = Vec::with_capacity(Direction::ALL.len());
    for direction in Direction::ALL {
      if DriverState::of(stop) == DriverState::Stopped {
        break;
      }
      let summary = self.run_direction(direction, stop).await?;
      summaries.push((direction, summary));
    }
    Ok(summaries)
  }

  #[instrument(skip_all, fields(%direction))]
  async fn run_direction(
    &self,
    direction: Direction,
    stop: &watch::Receiver<bool>,
  ) -> Result<PassSummary> {
    let stopped = || DriverState::of(stop) == DriverState::Stopped;
    let mut summary = PassSummary::default();

    let recovered = self.recover_unconfirmed(direction).await?;
    summary.recovered = recovered.unwrap_or(0);
    if stopped() {
      return Ok(summary);
    }

    summary.cancelled = self.cancel_stale(direction).await?;
    if stopped() {
      return Ok(summary);
    }

    let completed = self.reconcile(direction).await?;
    summary.completed = completed.len();
    if direction == Direction::Deletion && !completed.is_empty() {
      let candidates: Vec<_> = completed
        .iter()
        .map(DirCleanupCandidate::for_deletion)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
      let added = self
        .ledger
        .add_dir_cleanup_candidates(candidates)
        .await
        .map_err(Error::ledger)?;
      debug!(added, "directory cleanup candidates recorded");
    }
    if stopped() {
      return Ok(summary);
    }

    if recovered.is_none() {
      // Unconfirmed tasks are still bound to their subscriptions.
      warn!("skipping submission until unconfirmed tasks are withdrawn");
      return Ok(summary);
    }

    let subscriptions = self
      .get_subscriptions(direction, Status::ACTIONABLE.to_vec())
      .await?;
    let tasks = plan_tasks(direction, subscriptions, &self.settings.missing_file_exitcodes);
    if stopped() {
      return Ok(summary);
    }

    let planned = tasks.len();
    let batches = self.backend(direction).form_batches(tasks);
    let formed: usize = batches.iter().map(Vec::len).sum();
    summary.dropped = planned.saturating_sub(formed);
    if summary.dropped > 0 {
      info!(planned, formed, "backend dropped tasks while forming batches");
    }

    for batch in batches {
      if stopped() {
        break;
      }
      let (ok, rejected) = self.submit(direction, batch).await?;
      summary.submitted += ok;
      summary.rejected += rejected;
    }

    info!(
      recovered = summary.recovered,
      cancelled = summary.cancelled,
      completed = summary.completed,
      submitted = summary.submitted,
      rejected = summary.rejected,
      dropped = summary.dropped,
      "pass finished"
    );
    Ok(summary)
  }

  /// Withdraw tasks whose subscription never reached `inbatch`, which
  /// happens when a submission was interrupted. They are cancelled at the
  /// backend and deleted so the subscription is submitted afresh.
  ///
  /// Returns `None` if the backend could not confirm the cancellation; the
  /// tasks then stay and submission waits for a later pass.
  async fn recover_unconfirmed(&self, direction: Direction) -> Result<Option<usize>> {
    let stale = self
      .ledger
      .tasks_in_status(direction, Status::ACTIONABLE.to_vec())
      .await
      .map_err(Error::ledger)?;
    if stale.is_empty() {
      return Ok(Some(0));
    }
    if self.settings.read_only {
      info!(tasks = stale.len(), "read-only: would withdraw unconfirmed tasks");
      return Ok(Some(0));
    }

    let ids: Vec<TaskId> = stale.iter().map(|t| t.id).collect();
    if let Err(e) = self
      .call_backend(direction, "cancel", self.backend(direction).cancel(&ids))
      .await
    {
      warn!(tasks = ids.len(), error = %e, "could not cancel unconfirmed tasks");
      return Ok(None);
    }

    let mut batches = BTreeSet::new();
    for task in &stale {
      self
        .ledger
        .delete_task(direction, task.id)
        .await
        .map_err(Error::ledger)?;
      batches.insert(task.batch_id);
    }
    for batch_id in batches {
      self.drop_batch_if_empty(direction, batch_id).await?;
    }

    info!(tasks = stale.len(), "withdrew unconfirmed tasks");
    Ok(Some(stale.len()))
  }

  /// Ask the backend to stop tasks of cancelled subscriptions, and delete
  /// cancelled subscriptions that have no task left.
  async fn cancel_stale(&self, direction: Direction) -> Result<usize> {
    let stale = self
      .ledger
      .tasks_in_status(direction, vec![Status::Cancelled])
      .await
      .map_err(Error::ledger)?;

    if !stale.is_empty() {
      let ids: Vec<TaskId> = stale.iter().map(|t| t.id).collect();
      if self.settings.read_only {
        info!(tasks = ids.len(), "read-only: would cancel tasks");
      } else if let Err(e) = self
        .call_backend(direction, "cancel", self.backend(direction).cancel(&ids))
        .await
      {
        warn!(tasks = ids.len(), error = %e, "could not cancel stale tasks");
      }
    }

    let purged = self
      .ledger
      .purge_cancelled(direction)
      .await
      .map_err(Error::ledger)?;
    if purged > 0 {
      debug!(purged, "cancelled subscriptions without task deleted");
    }
    Ok(stale.len())
  }
}

/// One unpersisted task per subscription. Transfers without any source are
/// skipped; `get_subscriptions` has held them already.
fn plan_tasks(
  direction: Direction,
  subscriptions: Vec<Subscription>,
  missing: &[i32],
) -> Vec<Task> {
  match direction {
    Direction::Deletion => subscriptions.into_iter().map(Task::deletion).collect(),
    Direction::Transfer => {
      let mut rng = rand::thread_rng();
      subscriptions
        .into_iter()
        .filter_map(|sub| {
          let source = select_source(&sub, missing, &mut rng)?;
          Some(Task::transfer(sub, source))
        })
        .collect()
    }
  }
}
