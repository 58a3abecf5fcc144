//! The `Ledger` trait — durable storage for subscriptions, tasks, batches and
//! their side tables.
//!
//! The trait is implemented by storage backends (e.g. `rlfsm-store-sqlite`).
//! The engine depends on this abstraction, not on any concrete backend.
//!
//! Every status change is a compare-and-set keyed on the row id and its
//! expected current status, so concurrent writers never need a lock beyond
//! the short critical section inside [`Ledger::subscribe`].
//!
//! A read-only ledger turns every write into a no-op that reports "nothing
//! changed" (`false`, `0`, or an empty list).

use std::future::Future;

use crate::{
  subscription::{
    DirCleanupCandidate, Direction, FailedAttempt, FileRef, PreSubscription,
    Status,
    SubscribeOutcome, Subscription, SubscriptionId,
  },
  task::{Batch, BatchId, NewTask, TaskId, TaskRecord},
};

/// Abstraction over the RLFSM's persistent state.
///
/// All methods return `Send` futures so the trait can be driven from a
/// multi-threaded tokio runtime.
pub trait Ledger: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Subscriptions ─────────────────────────────────────────────────────

  /// Create a `new` subscription for `(file, site)` in `direction`.
  ///
  /// Atomically cancels any live subscription of the opposite direction for
  /// the same `(file, site)` first. If a live subscription of `direction`
  /// already exists it is left untouched and reported as
  /// [`SubscribeOutcome::AlreadyLive`].
  fn subscribe(
    &self,
    direction: Direction,
    file: FileRef,
    site: String,
  ) -> impl Future<Output = Result<SubscribeOutcome, Self::Error>> + Send + '_;

  /// All subscriptions of `direction` whose status is in `statuses`, ordered
  /// by id. Transfer subscriptions carry their `failed_sources`.
  fn subscriptions(
    &self,
    direction: Direction,
    statuses: Vec<Status>,
  ) -> impl Future<Output = Result<Vec<Subscription>, Self::Error>> + Send + '_;

  /// A single subscription by id.
  fn subscription(
    &self,
    direction: Direction,
    id: SubscriptionId,
  ) -> impl Future<Output = Result<Option<Subscription>, Self::Error>> + Send + '_;

  /// Move subscription `id` from `expected` to `status`. Returns `false` if
  /// the row was not in `expected`. Moving to `done` or `cancelled` clears
  /// the failure history.
  fn set_status(
    &self,
    direction: Direction,
    id: SubscriptionId,
    expected: Status,
    status: Status,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Delete subscription `id` if it is in `expected` and no task references
  /// it. Returns whether a row was deleted.
  fn delete_subscription(
    &self,
    direction: Direction,
    id: SubscriptionId,
    expected: Status,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Delete every `cancelled` subscription without a task.
  fn purge_cancelled(
    &self,
    direction: Direction,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Failure history (transfers only) ──────────────────────────────────

  fn record_failure(
    &self,
    attempt: FailedAttempt,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn clear_failures(
    &self,
    subscription_id: SubscriptionId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Pre-subscriptions ─────────────────────────────────────────────────

  /// Record an intent whose file or site is not yet known. Replaces any
  /// pending intent of the opposite direction for the same pair.
  fn defer(
    &self,
    direction: Direction,
    file_name: String,
    site_name: String,
  ) -> impl Future<Output = Result<Option<PreSubscription>, Self::Error>> + Send + '_;

  fn pre_subscriptions(
    &self,
  ) -> impl Future<Output = Result<Vec<PreSubscription>, Self::Error>> + Send + '_;

  fn delete_pre_subscription(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Tasks and batches ─────────────────────────────────────────────────

  /// Persist a batch and one task per input in a single transaction. The
  /// returned records are in input order.
  fn create_batch(
    &self,
    direction: Direction,
    tasks: Vec<NewTask>,
  ) -> impl Future<Output = Result<(Batch, Vec<TaskRecord>), Self::Error>> + Send + '_;

  fn batches(
    &self,
    direction: Direction,
  ) -> impl Future<Output = Result<Vec<Batch>, Self::Error>> + Send + '_;

  fn task(
    &self,
    direction: Direction,
    id: TaskId,
  ) -> impl Future<Output = Result<Option<TaskRecord>, Self::Error>> + Send + '_;

  /// Tasks of `batch_id`, ordered by id.
  fn tasks(
    &self,
    direction: Direction,
    batch_id: BatchId,
  ) -> impl Future<Output = Result<Vec<TaskRecord>, Self::Error>> + Send + '_;

  /// Tasks whose subscription is currently in one of `statuses`.
  fn tasks_in_status(
    &self,
    direction: Direction,
    statuses: Vec<Status>,
  ) -> impl Future<Output = Result<Vec<TaskRecord>, Self::Error>> + Send + '_;

  fn delete_task(
    &self,
    direction: Direction,
    id: TaskId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Delete `batch_id` if no task references it. Returns whether it was
  /// deleted.
  fn delete_batch_if_empty(
    &self,
    direction: Direction,
    batch_id: BatchId,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  // ── Directory cleanup hand-off ────────────────────────────────────────

  /// Record candidates, ignoring ones already recorded. Returns how many
  /// were new.
  fn add_dir_cleanup_candidates(
    &self,
    candidates: Vec<DirCleanupCandidate>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Return and remove every recorded candidate.
  fn take_dir_cleanup_candidates(
    &self,
  ) -> impl Future<Output = Result<Vec<DirCleanupCandidate>, Self::Error>> + Send + '_;
}
