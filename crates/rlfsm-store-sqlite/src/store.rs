//! [`SqliteStore`] — the SQLite implementation of [`Ledger`].

use std::{
  collections::{BTreeMap, HashMap},
  path::Path,
};

use chrono::Utc;
use rusqlite::{OptionalExtension as _, TransactionBehavior, params};
use tracing::debug;

use rlfsm_core::{
  ledger::Ledger,
  subscription::{
    DirCleanupCandidate, Direction, FailedAttempt, FileRef, PreSubscription,
    Status, SubscribeOutcome, Subscription, SubscriptionId,
  },
  task::{Batch, BatchId, NewTask, TaskId, TaskRecord},
};

use crate::{
  Result,
  encode::{
    RawBatch, RawPreSubscription, RawSubscription, RawTask,
    SUBSCRIPTION_COLUMNS, encode_dt, encode_size, status_list,
  },
  schema::{SCHEMA, tables},
};

type FailureRow = (SubscriptionId, String, i32);

// ─── Store ───────────────────────────────────────────────────────────────────

/// The RLFSM ledger backed by a single SQLite file.
///
/// Clones share one connection thread. Also serves as the
/// [`Inventory`](rlfsm_core::inventory::Inventory) over
/// the catalog tables kept in the same file.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
  read_only:       bool,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn, read_only: false };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open a private in-memory store.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn, read_only: false };
    store.init_schema().await?;
    Ok(store)
  }

  /// Turn every ledger write into a logged no-op.
  pub fn with_read_only(mut self, read_only: bool) -> Self {
    self.read_only = read_only;
    self
  }

  pub fn is_read_only(&self) -> bool { self.read_only }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// `true` if writes are disabled; logs the skipped operation.
  fn skip_write(&self, operation: &'static str) -> bool {
    if self.read_only {
      debug!(operation, "read-only ledger: write skipped");
    }
    self.read_only
  }

  async fn task_rows(
    &self,
    direction: Direction,
    filter: String,
    param: Option<i64>,
  ) -> Result<Vec<TaskRecord>> {
    let t = tables(direction);
    let raws: Vec<RawTask> = self
      .conn
      .call(move |conn| {
        let sql = format!(
          "SELECT {} FROM {} t {filter} ORDER BY t.id",
          t.task_columns(),
          t.tasks
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = match param {
          Some(p) => stmt
            .query_map(params![p], RawTask::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
          None => stmt
            .query_map([], RawTask::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(|r| r.into_record(direction)).collect()
  }
}

fn group_failures(
  rows: Vec<FailureRow>,
) -> HashMap<SubscriptionId, BTreeMap<String, Vec<i32>>> {
  let mut grouped: HashMap<SubscriptionId, BTreeMap<String, Vec<i32>>> =
    HashMap::new();
  for (id, site, exitcode) in rows {
    grouped
      .entry(id)
      .or_default()
      .entry(site)
      .or_default()
      .push(exitcode);
  }
  grouped
}

fn failure_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FailureRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

// ─── Ledger impl ─────────────────────────────────────────────────────────────

impl Ledger for SqliteStore {
  type Error = crate::Error;

  // ── Subscriptions ─────────────────────────────────────────────────────────

  async fn subscribe(
    &self,
    direction: Direction,
    file: FileRef,
    site: String,
  ) -> Result<SubscribeOutcome> {
    let own       = tables(direction);
    let other     = tables(direction.opposite());
    let live      = status_list(&Status::LIVE);
    let now       = encode_dt(Utc::now());
    let size      = encode_size(file.size);
    let read_only = self.read_only;

    let (outcome, cancelled) = self
      .conn
      .call(move |conn| {
        // IMMEDIATE takes the write lock up front: the cancel and the insert
        // below are atomic with respect to other subscribers.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<i64> = tx
          .query_row(
            &format!(
              "SELECT id FROM {} WHERE file_name = ?1 AND site_name = ?2 AND status IN ({live})",
              own.subscriptions
            ),
            params![file.name, site],
            |r| r.get(0),
          )
          .optional()?;

        if read_only {
          let outcome =
            existing.map_or(SubscribeOutcome::ReadOnly, SubscribeOutcome::AlreadyLive);
          return Ok((outcome, 0));
        }

        let cancelled = tx.execute(
          &format!(
            "UPDATE {} SET status = 'cancelled', last_update = ?3
             WHERE file_name = ?1 AND site_name = ?2 AND status IN ({live})",
            other.subscriptions
          ),
          params![file.name, site, now],
        )?;

        if cancelled > 0 && direction.opposite() == Direction::Transfer {
          tx.execute(
            "DELETE FROM failed_transfers WHERE subscription_id IN (
               SELECT id FROM transfer_subscriptions
               WHERE file_name = ?1 AND site_name = ?2 AND status = 'cancelled'
             )",
            params![file.name, site],
          )?;
        }

        let outcome = match existing {
          Some(id) => SubscribeOutcome::AlreadyLive(id),
          None => {
            tx.execute(
              &format!(
                "INSERT INTO {} (file_name, file_size, site_name, status, created_at, last_update)
                 VALUES (?1, ?2, ?3, 'new', ?4, ?4)",
                own.subscriptions
              ),
              params![file.name, size, site, now],
            )?;
            SubscribeOutcome::Subscribed(tx.last_insert_rowid())
          }
        };

        tx.commit()?;
        Ok((outcome, cancelled))
      })
      .await?;

    if cancelled > 0 {
      debug!(
        %direction,
        cancelled,
        "cancelled conflicting subscriptions of the opposite direction"
      );
    }
    Ok(outcome)
  }

  async fn subscriptions(
    &self,
    direction: Direction,
    statuses: Vec<Status>,
  ) -> Result<Vec<Subscription>> {
    let t    = tables(direction);
    let list = status_list(&statuses);

    let (raws, failures): (Vec<RawSubscription>, Vec<FailureRow>) = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SUBSCRIPTION_COLUMNS} FROM {} WHERE status IN ({list}) ORDER BY id",
          t.subscriptions
        ))?;
        let raws = stmt
          .query_map([], RawSubscription::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;

        let failures = if direction == Direction::Transfer {
          let mut stmt = conn.prepare(&format!(
            "SELECT f.subscription_id, f.source_site, f.exitcode
             FROM failed_transfers f
             JOIN transfer_subscriptions s ON s.id = f.subscription_id
             WHERE s.status IN ({list})
             ORDER BY f.id"
          ))?;
          stmt
            .query_map([], failure_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
          Vec::new()
        };

        Ok((raws, failures))
      })
      .await?;

    let mut failures = group_failures(failures);
    raws
      .into_iter()
      .map(|raw| {
        let failed = failures.remove(&raw.id).unwrap_or_default();
        raw.into_subscription(direction, failed)
      })
      .collect()
  }

  async fn subscription(
    &self,
    direction: Direction,
    id: SubscriptionId,
  ) -> Result<Option<Subscription>> {
    let t = tables(direction);

    let (raw, failures): (Option<RawSubscription>, Vec<FailureRow>) = self
      .conn
      .call(move |conn| {
        let raw = conn
          .query_row(
            &format!(
              "SELECT {SUBSCRIPTION_COLUMNS} FROM {} WHERE id = ?1",
              t.subscriptions
            ),
            params![id],
            RawSubscription::from_row,
          )
          .optional()?;

        let failures = if raw.is_some() && direction == Direction::Transfer {
          let mut stmt = conn.prepare(
            "SELECT subscription_id, source_site, exitcode
             FROM failed_transfers WHERE subscription_id = ?1 ORDER BY id",
          )?;
          stmt
            .query_map(params![id], failure_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
          Vec::new()
        };

        Ok((raw, failures))
      })
      .await?;

    let failed = group_failures(failures).remove(&id).unwrap_or_default();
    raw.map(|r| r.into_subscription(direction, failed)).transpose()
  }

  async fn set_status(
    &self,
    direction: Direction,
    id: SubscriptionId,
    expected: Status,
    status: Status,
  ) -> Result<bool> {
    if self.skip_write("set_status") {
      return Ok(false);
    }

    let t     = tables(direction);
    let now   = encode_dt(Utc::now());
    let clear = direction == Direction::Transfer && status.is_terminal();

    let updated = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let n = tx.execute(
          &format!(
            "UPDATE {} SET status = ?1, last_update = ?2 WHERE id = ?3 AND status = ?4",
            t.subscriptions
          ),
          params![status.as_ref(), now, id, expected.as_ref()],
        )?;
        if n > 0 && clear {
          tx.execute(
            "DELETE FROM failed_transfers WHERE subscription_id = ?1",
            params![id],
          )?;
        }
        tx.commit()?;
        Ok(n > 0)
      })
      .await?;

    if updated {
      debug!(%direction, id, from = %expected, to = %status, "subscription status changed");
    }
    Ok(updated)
  }

  async fn delete_subscription(
    &self,
    direction: Direction,
    id: SubscriptionId,
    expected: Status,
  ) -> Result<bool> {
    if self.skip_write("delete_subscription") {
      return Ok(false);
    }

    let t = tables(direction);
    let deleted = self
      .conn
      .call(move |conn| {
        // failed_transfers rows go with it (ON DELETE CASCADE).
        let n = conn.execute(
          &format!(
            "DELETE FROM {} WHERE id = ?1 AND status = ?2
               AND NOT EXISTS (SELECT 1 FROM {} WHERE subscription_id = ?1)",
            t.subscriptions, t.tasks
          ),
          params![id, expected.as_ref()],
        )?;
        Ok(n > 0)
      })
      .await?;
    Ok(deleted)
  }

  async fn purge_cancelled(&self, direction: Direction) -> Result<usize> {
    if self.skip_write("purge_cancelled") {
      return Ok(0);
    }

    let t = tables(direction);
    let purged = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          &format!(
            "DELETE FROM {} WHERE status = 'cancelled'
               AND id NOT IN (SELECT subscription_id FROM {})",
            t.subscriptions, t.tasks
          ),
          [],
        )?;
        Ok(n)
      })
      .await?;
    Ok(purged)
  }

  // ── Failure history ───────────────────────────────────────────────────────

  async fn record_failure(&self, attempt: FailedAttempt) -> Result<()> {
    if self.skip_write("record_failure") {
      return Ok(());
    }

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO failed_transfers (subscription_id, source_site, exitcode)
           VALUES (?1, ?2, ?3)",
          params![attempt.subscription_id, attempt.source_site, attempt.exitcode],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn clear_failures(&self, subscription_id: SubscriptionId) -> Result<()> {
    if self.skip_write("clear_failures") {
      return Ok(());
    }

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM failed_transfers WHERE subscription_id = ?1",
          params![subscription_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Pre-subscriptions ─────────────────────────────────────────────────────

  async fn defer(
    &self,
    direction: Direction,
    file_name: String,
    site_name: String,
  ) -> Result<Option<PreSubscription>> {
    if self.skip_write("defer") {
      return Ok(None);
    }

    let own   = direction.as_ref().to_owned();
    let other = direction.opposite().as_ref().to_owned();
    let now   = encode_dt(Utc::now());

    let raw: RawPreSubscription = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
          "DELETE FROM pre_subscriptions
           WHERE file_name = ?1 AND site_name = ?2 AND direction = ?3",
          params![file_name, site_name, other],
        )?;
        tx.execute(
          "INSERT OR IGNORE INTO pre_subscriptions (file_name, site_name, direction, created_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![file_name, site_name, own, now],
        )?;
        let raw = tx.query_row(
          "SELECT id, file_name, site_name, direction, created_at
           FROM pre_subscriptions
           WHERE file_name = ?1 AND site_name = ?2 AND direction = ?3",
          params![file_name, site_name, own],
          |row| {
            Ok(RawPreSubscription {
              id:         row.get(0)?,
              file_name:  row.get(1)?,
              site_name:  row.get(2)?,
              direction:  row.get(3)?,
              created_at: row.get(4)?,
            })
          },
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.into_pre_subscription().map(Some)
  }

  async fn pre_subscriptions(&self) -> Result<Vec<PreSubscription>> {
    let raws: Vec<RawPreSubscription> = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT id, file_name, site_name, direction, created_at
           FROM pre_subscriptions ORDER BY id",
        )?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawPreSubscription {
              id:         row.get(0)?,
              file_name:  row.get(1)?,
              site_name:  row.get(2)?,
              direction:  row.get(3)?,
              created_at: row.get(4)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(RawPreSubscription::into_pre_subscription)
      .collect()
  }

  async fn delete_pre_subscription(&self, id: i64) -> Result<()> {
    if self.skip_write("delete_pre_subscription") {
      return Ok(());
    }

    self
      .conn
      .call(move |conn| {
        conn.execute("DELETE FROM pre_subscriptions WHERE id = ?1", params![id])?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Tasks and batches ─────────────────────────────────────────────────────

  async fn create_batch(
    &self,
    direction: Direction,
    tasks: Vec<NewTask>,
  ) -> Result<(Batch, Vec<TaskRecord>)> {
    let created_at = Utc::now();
    if self.skip_write("create_batch") {
      let batch = Batch { id: 0, direction, created_at };
      return Ok((batch, Vec::new()));
    }

    let t   = tables(direction);
    let now = encode_dt(created_at);
    let rows: Vec<(SubscriptionId, Option<String>, String)> = tasks
      .into_iter()
      .map(|nt| (nt.subscription_id, nt.source, encode_dt(nt.created_at)))
      .collect();

    let (batch_id, raws): (BatchId, Vec<RawTask>) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          &format!("INSERT INTO {} (created_at) VALUES (?1)", t.batches),
          params![now],
        )?;
        let batch_id = tx.last_insert_rowid();

        for (subscription_id, source, created) in &rows {
          match direction {
            Direction::Transfer => tx.execute(
              "INSERT INTO transfer_tasks (subscription_id, source_site, batch_id, created_at)
               VALUES (?1, ?2, ?3, ?4)",
              params![subscription_id, source, batch_id, created],
            )?,
            Direction::Deletion => tx.execute(
              "INSERT INTO deletion_tasks (subscription_id, batch_id, created_at)
               VALUES (?1, ?2, ?3)",
              params![subscription_id, batch_id, created],
            )?,
          };
        }

        // Read the rows back for their assigned ids; AUTOINCREMENT keeps
        // them in insertion order.
        let raws = {
          let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM {} t WHERE t.batch_id = ?1 ORDER BY t.id",
            t.task_columns(),
            t.tasks
          ))?;
          stmt
            .query_map(params![batch_id], RawTask::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        tx.commit()?;
        Ok((batch_id, raws))
      })
      .await?;

    let records = raws
      .into_iter()
      .map(|r| r.into_record(direction))
      .collect::<Result<Vec<_>>>()?;

    debug!(%direction, batch_id, tasks = records.len(), "batch persisted");
    Ok((Batch { id: batch_id, direction, created_at }, records))
  }

  async fn batches(&self, direction: Direction) -> Result<Vec<Batch>> {
    let t = tables(direction);
    let raws: Vec<RawBatch> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT id, created_at FROM {} ORDER BY id",
          t.batches
        ))?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawBatch { id: row.get(0)?, created_at: row.get(1)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(|r| r.into_batch(direction)).collect()
  }

  async fn task(&self, direction: Direction, id: TaskId) -> Result<Option<TaskRecord>> {
    let mut rows = self
      .task_rows(direction, "WHERE t.id = ?1".to_owned(), Some(id))
      .await?;
    Ok(rows.pop())
  }

  async fn tasks(
    &self,
    direction: Direction,
    batch_id: BatchId,
  ) -> Result<Vec<TaskRecord>> {
    self
      .task_rows(direction, "WHERE t.batch_id = ?1".to_owned(), Some(batch_id))
      .await
  }

  async fn tasks_in_status(
    &self,
    direction: Direction,
    statuses: Vec<Status>,
  ) -> Result<Vec<TaskRecord>> {
    let t = tables(direction);
    let filter = format!(
      "JOIN {} s ON s.id = t.subscription_id WHERE s.status IN ({})",
      t.subscriptions,
      status_list(&statuses)
    );
    self.task_rows(direction, filter, None).await
  }

  async fn delete_task(&self, direction: Direction, id: TaskId) -> Result<bool> {
    if self.skip_write("delete_task") {
      return Ok(false);
    }

    let t = tables(direction);
    let deleted = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          &format!("DELETE FROM {} WHERE id = ?1", t.tasks),
          params![id],
        )?;
        Ok(n > 0)
      })
      .await?;
    Ok(deleted)
  }

  async fn delete_batch_if_empty(
    &self,
    direction: Direction,
    batch_id: BatchId,
  ) -> Result<bool> {
    if self.skip_write("delete_batch_if_empty") {
      return Ok(false);
    }

    let t = tables(direction);
    let deleted = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          &format!(
            "DELETE FROM {} WHERE id = ?1
               AND NOT EXISTS (SELECT 1 FROM {} WHERE batch_id = ?1)",
            t.batches, t.tasks
          ),
          params![batch_id],
        )?;
        Ok(n > 0)
      })
      .await?;
    Ok(deleted)
  }

  // ── Directory cleanup ─────────────────────────────────────────────────────

  async fn add_dir_cleanup_candidates(
    &self,
    candidates: Vec<DirCleanupCandidate>,
  ) -> Result<usize> {
    if candidates.is_empty() || self.skip_write("add_dir_cleanup_candidates") {
      return Ok(0);
    }

    let added = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut added = 0;
        for c in &candidates {
          added += tx.execute(
            "INSERT OR IGNORE INTO directory_cleaning_tasks (site_name, directory)
             VALUES (?1, ?2)",
            params![c.site, c.directory],
          )?;
        }
        tx.commit()?;
        Ok(added)
      })
      .await?;
    Ok(added)
  }

  async fn take_dir_cleanup_candidates(&self) -> Result<Vec<DirCleanupCandidate>> {
    let read_only = self.read_only;
    let candidates = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let rows = {
          let mut stmt = tx.prepare(
            "SELECT site_name, directory FROM directory_cleaning_tasks
             ORDER BY site_name, directory",
          )?;
          stmt
            .query_map([], |row| {
              Ok(DirCleanupCandidate {
                site:      row.get(0)?,
                directory: row.get(1)?,
              })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if !read_only {
          tx.execute("DELETE FROM directory_cleaning_tasks", [])?;
          tx.commit()?;
        }
        Ok(rows)
      })
      .await?;
    Ok(candidates)
  }
}
