//! The subscription store: entry points for subscribing and desubscribing,
//! and the read path that triages subscriptions against the inventory.

use rlfsm_core::{
  backend::OperationBackend,
  history::History,
  inventory::{Inventory, ReplicaState, StorageClass},
  ledger::Ledger,
  subscription::{
    DirCleanupCandidate, Direction, Status, SubscribeOutcome, Subscription,
    SubscriptionId,
  },
};
use tracing::{debug, info, warn};

use crate::{Error, Result, Rlfsm};

/// What the inventory says should happen to a subscription on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
  /// Hand it to the caller.
  Keep,
  /// Exclude it and move it to `status`.
  Move(Status, &'static str),
  /// File or site vanished from the inventory.
  Orphaned,
}

impl<L, I, H, B> Rlfsm<L, I, H, B>
where
  L: Ledger,
  I: Inventory,
  H: History,
  B: OperationBackend,
{
  // ─── Intake ──────────────────────────────────────────────────────────────

  /// Ask for a copy of `file_name` at `site`.
  pub async fn subscribe(&self, file_name: &str, site: &str) -> Result<SubscribeOutcome> {
    self.subscribe_file(Direction::Transfer, file_name, site).await
  }

  /// Ask for the replica of `file_name` at `site` to be removed.
  pub async fn desubscribe(
    &self,
    file_name: &str,
    site: &str,
  ) -> Result<SubscribeOutcome> {
    self.subscribe_file(Direction::Deletion, file_name, site).await
  }

  /// Create a subscription of `direction`, or a pre-subscription when the
  /// inventory does not know the file or the site yet.
  pub async fn subscribe_file(
    &self,
    direction: Direction,
    file_name: &str,
    site: &str,
  ) -> Result<SubscribeOutcome> {
    let file = self
      .inventory
      .find_file(file_name)
      .await
      .map_err(Error::inventory)?;
    let site_known = self
      .inventory
      .site_exists(site)
      .await
      .map_err(Error::inventory)?;

    let outcome = match file {
      Some(file) if site_known => self
        .ledger
        .subscribe(direction, file, site.to_owned())
        .await
        .map_err(Error::ledger)?,
      _ => {
        let pre = self
          .ledger
          .defer(direction, file_name.to_owned(), site.to_owned())
          .await
          .map_err(Error::ledger)?;
        pre.map_or(SubscribeOutcome::ReadOnly, |p| SubscribeOutcome::Deferred(p.id))
      }
    };

    info!(%direction, file = file_name, site, ?outcome, "subscription requested");
    Ok(outcome)
  }

  /// Turn every pre-subscription whose file and site are now known into a
  /// real subscription. Returns how many were converted.
  pub async fn convert_pre_subscriptions(&self) -> Result<usize> {
    let pending = self
      .ledger
      .pre_subscriptions()
      .await
      .map_err(Error::ledger)?;

    let mut converted = 0;
    for pre in pending {
      let Some(file) = self
        .inventory
        .find_file(&pre.file_name)
        .await
        .map_err(Error::inventory)?
      else {
        continue;
      };
      if !self
        .inventory
        .site_exists(&pre.site_name)
        .await
        .map_err(Error::inventory)?
      {
        continue;
      }

      let outcome = self
        .ledger
        .subscribe(pre.direction, file, pre.site_name.clone())
        .await
        .map_err(Error::ledger)?;
      if outcome == SubscribeOutcome::ReadOnly {
        continue;
      }
      self
        .ledger
        .delete_pre_subscription(pre.id)
        .await
        .map_err(Error::ledger)?;

      debug!(
        direction = %pre.direction,
        file = %pre.file_name,
        site = %pre.site_name,
        ?outcome,
        "pre-subscription converted"
      );
      converted += 1;
    }
    Ok(converted)
  }

  // ─── Read path ───────────────────────────────────────────────────────────

  /// Subscriptions of `direction` in any of `statuses`, with transfer
  /// sources filled in from the inventory.
  ///
  /// Pending pre-subscriptions are converted first. Rows the inventory shows
  /// to be satisfied, impossible, or orphaned are transitioned and left out
  /// of the result; `inbatch` rows are never marked done or held here since
  /// their task is still outstanding. Terminal rows are returned untouched.
  pub async fn get_subscriptions(
    &self,
    direction: Direction,
    statuses: Vec<Status>,
  ) -> Result<Vec<Subscription>> {
    self.convert_pre_subscriptions().await?;

    let rows = self
      .ledger
      .subscriptions(direction, statuses)
      .await
      .map_err(Error::ledger)?;

    let mut kept = Vec::with_capacity(rows.len());
    for mut sub in rows {
      match self.triage(&mut sub).await? {
        Verdict::Keep => kept.push(sub),
        Verdict::Move(status, reason) => {
          let moved = self
            .ledger
            .set_status(direction, sub.id, sub.status, status)
            .await
            .map_err(Error::ledger)?;
          if status == Status::Held {
            warn!(%direction, id = sub.id, file = %sub.file.name, site = %sub.site, reason, "subscription held");
          } else {
            debug!(%direction, id = sub.id, to = %status, reason, moved, "subscription settled on read");
          }
        }
        Verdict::Orphaned => self.drop_orphan(&sub).await?,
      }
    }
    Ok(kept)
  }

  async fn triage(&self, sub: &mut Subscription) -> Result<Verdict> {
    if sub.status.is_terminal() {
      return Ok(Verdict::Keep);
    }

    let file_known = self
      .inventory
      .find_file(&sub.file.name)
      .await
      .map_err(Error::inventory)?
      .is_some();
    let site_known = self
      .inventory
      .site_exists(&sub.site)
      .await
      .map_err(Error::inventory)?;
    if !file_known || !site_known {
      return Ok(Verdict::Orphaned);
    }

    let in_flight = sub.status == Status::InBatch;
    let state = self
      .inventory
      .replica_state(&sub.file.name, &sub.site)
      .await
      .map_err(Error::inventory)?;

    match sub.direction {
      Direction::Transfer => match state {
        ReplicaState::NoBlockReplica => {
          return Ok(Verdict::Move(
            Status::Cancelled,
            "destination block replica vanished",
          ));
        }
        ReplicaState::FilePresent if !in_flight => {
          return Ok(Verdict::Move(Status::Done, "file already at destination"));
        }
        _ => {}
      },
      Direction::Deletion => {
        if !in_flight && state != ReplicaState::FilePresent {
          return Ok(Verdict::Move(Status::Done, "file already absent"));
        }
        return Ok(Verdict::Keep);
      }
    }

    self.fill_sources(sub).await?;
    if in_flight {
      return Ok(Verdict::Keep);
    }
    if !sub.has_sources() {
      return Ok(Verdict::Move(Status::Held, "no viable source"));
    }
    if sub.status == Status::Retry && self.sources_exhausted(sub) {
      return Ok(Verdict::Move(Status::Held, "file missing at every source"));
    }
    Ok(Verdict::Keep)
  }

  /// Ready sites other than the destination that hold the file.
  async fn fill_sources(&self, sub: &mut Subscription) -> Result<()> {
    let candidates = self
      .inventory
      .source_candidates(&sub.file.name)
      .await
      .map_err(Error::inventory)?;

    sub.disk_sources.clear();
    sub.tape_sources.clear();
    for c in candidates {
      if !c.ready || c.name == sub.site {
        continue;
      }
      match c.storage {
        StorageClass::Disk => sub.disk_sources.push(c.name),
        StorageClass::Tape => sub.tape_sources.push(c.name),
      }
    }
    Ok(())
  }

  /// Every viable source was tried and last reported the file missing.
  fn sources_exhausted(&self, sub: &Subscription) -> bool {
    let missing = &self.settings.missing_file_exitcodes;
    sub
      .disk_sources
      .iter()
      .chain(&sub.tape_sources)
      .all(|site| {
        sub
          .failed_sources
          .get(site)
          .and_then(|codes| codes.last())
          .is_some_and(|code| missing.contains(code))
      })
  }

  async fn drop_orphan(&self, sub: &Subscription) -> Result<()> {
    // A row with an outstanding task is cancelled so the reconciler can
    // finish the task before the row goes.
    let removed = if sub.status == Status::InBatch {
      self
        .ledger
        .set_status(sub.direction, sub.id, sub.status, Status::Cancelled)
        .await
    } else {
      self
        .ledger
        .delete_subscription(sub.direction, sub.id, sub.status)
        .await
    }
    .map_err(Error::ledger)?;

    info!(
      direction = %sub.direction,
      id = sub.id,
      file = %sub.file.name,
      site = %sub.site,
      removed,
      "orphaned subscription dropped"
    );
    Ok(())
  }

  // ─── Operator actions ────────────────────────────────────────────────────

  /// Delete `done` subscriptions the consumer has acknowledged. Other ids
  /// are ignored. Returns how many rows went.
  pub async fn close_subscriptions(
    &self,
    direction: Direction,
    ids: &[SubscriptionId],
  ) -> Result<usize> {
    let mut closed = 0;
    for &id in ids {
      if self
        .ledger
        .delete_subscription(direction, id, Status::Done)
        .await
        .map_err(Error::ledger)?
      {
        closed += 1;
      }
    }
    debug!(%direction, requested = ids.len(), closed, "subscriptions closed");
    Ok(closed)
  }

  /// Cancel live subscriptions. In-flight tasks are cancelled at the backend
  /// on the next pass.
  pub async fn cancel_subscriptions(
    &self,
    direction: Direction,
    ids: &[SubscriptionId],
  ) -> Result<usize> {
    let mut cancelled = 0;
    for &id in ids {
      let Some(sub) = self
        .ledger
        .subscription(direction, id)
        .await
        .map_err(Error::ledger)?
      else {
        continue;
      };
      if !sub.status.is_live() {
        continue;
      }
      if self
        .ledger
        .set_status(direction, id, sub.status, Status::Cancelled)
        .await
        .map_err(Error::ledger)?
      {
        cancelled += 1;
      }
    }
    info!(%direction, requested = ids.len(), cancelled, "subscriptions cancelled");
    Ok(cancelled)
  }

  /// Put `held` subscriptions back in line with a clean failure history.
  pub async fn release_subscriptions(
    &self,
    direction: Direction,
    ids: &[SubscriptionId],
  ) -> Result<usize> {
    let mut released = 0;
    for &id in ids {
      if !self
        .ledger
        .set_status(direction, id, Status::Held, Status::Retry)
        .await
        .map_err(Error::ledger)?
      {
        continue;
      }
      if direction == Direction::Transfer {
        self
          .ledger
          .clear_failures(id)
          .await
          .map_err(Error::ledger)?;
      }
      released += 1;
    }
    info!(%direction, requested = ids.len(), released, "subscriptions released");
    Ok(released)
  }

  /// Hand over every directory that may have emptied since the last call.
  pub async fn take_dir_cleanup_candidates(&self) -> Result<Vec<DirCleanupCandidate>> {
    self
      .ledger
      .take_dir_cleanup_candidates()
      .await
      .map_err(Error::ledger)
  }
}
