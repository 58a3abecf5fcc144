//! Integration tests for `SqliteStore` and `SqliteHistory` against in-memory
//! databases.

use chrono::Utc;
use rlfsm_core::{
  history::{CompletionRecord, History as _},
  inventory::{Inventory as _, ReplicaState, StorageClass},
  ledger::Ledger as _,
  subscription::{
    DirCleanupCandidate, Direction, FailedAttempt, FileRef, Status, SubscribeOutcome,
  },
  task::NewTask,
};

use crate::{SqliteHistory, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

/// Populate the inventory tables:
///
/// - sites `T1_DISK` (ready disk), `T1_TAPE` (ready tape), `T2_DOWN` (disk in
///   the waitroom) and `T3_DEST` (ready disk, empty)
/// - block `/blk` with files `/store/a.root` and `/store/b.root`
/// - complete replicas at `T1_DISK` and `T1_TAPE`, an incomplete one at
///   `T2_DOWN` holding only `/store/a.root`
async fn seed(s: &SqliteStore) {
  s.conn
    .call(|conn| {
      conn.execute_batch(
        "INSERT INTO sites (name, storage_type, status) VALUES
           ('T1_DISK', 'disk', 'ready'),
           ('T1_TAPE', 'tape', 'ready'),
           ('T2_DOWN', 'disk', 'waitroom'),
           ('T3_DEST', 'disk', 'ready');
         INSERT INTO files (name, block_name, size) VALUES
           ('/store/a.root', '/blk', 100),
           ('/store/b.root', '/blk', 200);
         INSERT INTO block_replicas (block_name, site_name, is_complete) VALUES
           ('/blk', 'T1_DISK', 1),
           ('/blk', 'T1_TAPE', 1),
           ('/blk', 'T2_DOWN', 0);
         INSERT INTO block_replica_files (block_name, site_name, file_name) VALUES
           ('/blk', 'T2_DOWN', '/store/a.root');",
      )?;
      Ok(())
    })
    .await
    .expect("seed inventory");
}

fn file_a() -> FileRef { FileRef::new("/store/a.root", 100) }

fn failure(subscription_id: i64, source: &str, exitcode: i32) -> FailedAttempt {
  FailedAttempt { subscription_id, source_site: source.into(), exitcode }
}

fn subscribed(outcome: SubscribeOutcome) -> i64 {
  match outcome {
    SubscribeOutcome::Subscribed(id) => id,
    other => panic!("expected Subscribed, got {other:?}"),
  }
}

fn new_task(subscription_id: i64, source: Option<&str>) -> NewTask {
  NewTask {
    subscription_id,
    source: source.map(str::to_owned),
    created_at: Utc::now(),
  }
}

// ─── Subscribe ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_creates_new_subscription() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );

  let sub = s.subscription(Direction::Transfer, id).await.unwrap().unwrap();
  assert_eq!(sub.status, Status::New);
  assert_eq!(sub.file, file_a());
  assert_eq!(sub.site, "T3_DEST");
  assert_eq!(sub.direction, Direction::Transfer);
  assert!(sub.failed_sources.is_empty());
}

#[tokio::test]
async fn subscribe_twice_reports_already_live() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  let again = s
    .subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
    .await
    .unwrap();
  assert_eq!(again, SubscribeOutcome::AlreadyLive(id));

  let all = s
    .subscriptions(Direction::Transfer, Status::LIVE.to_vec())
    .await
    .unwrap();
  assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn subscribe_after_done_creates_fresh_row() {
  let s = store().await;
  let first = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  assert!(
    s.set_status(Direction::Transfer, first, Status::New, Status::Done)
      .await
      .unwrap()
  );

  let second = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  assert_ne!(first, second);
}

#[tokio::test]
async fn desubscribe_cancels_live_transfer_and_its_failures() {
  let s = store().await;
  let t = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.record_failure(failure(t, "T1_DISK", 5)).await.unwrap();

  let d = subscribed(
    s.subscribe(Direction::Deletion, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );

  let transfer = s.subscription(Direction::Transfer, t).await.unwrap().unwrap();
  assert_eq!(transfer.status, Status::Cancelled);
  assert!(transfer.failed_sources.is_empty());

  let deletion = s.subscription(Direction::Deletion, d).await.unwrap().unwrap();
  assert_eq!(deletion.status, Status::New);
}

#[tokio::test]
async fn subscribe_cancels_live_deletion() {
  let s = store().await;
  let d = subscribed(
    s.subscribe(Direction::Deletion, file_a(), "T1_DISK".into())
      .await
      .unwrap(),
  );
  s.subscribe(Direction::Transfer, file_a(), "T1_DISK".into())
    .await
    .unwrap();

  let deletion = s.subscription(Direction::Deletion, d).await.unwrap().unwrap();
  assert_eq!(deletion.status, Status::Cancelled);
}

#[tokio::test]
async fn subscribe_leaves_other_sites_alone() {
  let s = store().await;
  let t = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.subscribe(Direction::Deletion, file_a(), "T1_DISK".into())
    .await
    .unwrap();

  let transfer = s.subscription(Direction::Transfer, t).await.unwrap().unwrap();
  assert_eq!(transfer.status, Status::New);
}

// ─── Status changes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn set_status_is_compare_and_set() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );

  assert!(
    !s.set_status(Direction::Transfer, id, Status::Retry, Status::Held)
      .await
      .unwrap()
  );
  assert!(
    s.set_status(Direction::Transfer, id, Status::New, Status::InBatch)
      .await
      .unwrap()
  );
  let sub = s.subscription(Direction::Transfer, id).await.unwrap().unwrap();
  assert_eq!(sub.status, Status::InBatch);
  assert!(sub.last_update >= sub.created_at);
}

#[tokio::test]
async fn failures_are_grouped_by_source_and_cleared_on_done() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.record_failure(failure(id, "T1_DISK", 5)).await.unwrap();
  s.record_failure(failure(id, "T1_TAPE", 7)).await.unwrap();
  s.record_failure(failure(id, "T1_DISK", 9)).await.unwrap();

  let sub = s.subscription(Direction::Transfer, id).await.unwrap().unwrap();
  assert_eq!(sub.failed_sources["T1_DISK"], vec![5, 9]);
  assert_eq!(sub.failed_sources["T1_TAPE"], vec![7]);

  let listed = s
    .subscriptions(Direction::Transfer, vec![Status::New])
    .await
    .unwrap();
  assert_eq!(listed[0].failed_sources, sub.failed_sources);

  s.set_status(Direction::Transfer, id, Status::New, Status::Done)
    .await
    .unwrap();
  let sub = s.subscription(Direction::Transfer, id).await.unwrap().unwrap();
  assert!(sub.failed_sources.is_empty());
}

#[tokio::test]
async fn clear_failures_removes_history() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.record_failure(failure(id, "T1_DISK", 5)).await.unwrap();
  s.clear_failures(id).await.unwrap();

  let sub = s.subscription(Direction::Transfer, id).await.unwrap().unwrap();
  assert!(sub.failed_sources.is_empty());
}

#[tokio::test]
async fn subscriptions_filters_by_status() {
  let s = store().await;
  let a = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  subscribed(
    s.subscribe(Direction::Transfer, FileRef::new("/store/b.root", 200), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.set_status(Direction::Transfer, a, Status::New, Status::Held)
    .await
    .unwrap();

  let held = s
    .subscriptions(Direction::Transfer, vec![Status::Held])
    .await
    .unwrap();
  assert_eq!(held.len(), 1);
  assert_eq!(held[0].id, a);

  let none = s.subscriptions(Direction::Transfer, vec![]).await.unwrap();
  assert!(none.is_empty());
}

// ─── Deletion of rows ────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_subscription_refused_while_task_exists() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Deletion, file_a(), "T1_DISK".into())
      .await
      .unwrap(),
  );
  let (batch, records) = s
    .create_batch(Direction::Deletion, vec![new_task(id, None)])
    .await
    .unwrap();

  assert!(
    !s.delete_subscription(Direction::Deletion, id, Status::New)
      .await
      .unwrap()
  );

  assert!(s.delete_task(Direction::Deletion, records[0].id).await.unwrap());
  assert!(s.delete_batch_if_empty(Direction::Deletion, batch.id).await.unwrap());
  assert!(
    s.delete_subscription(Direction::Deletion, id, Status::New)
      .await
      .unwrap()
  );
  assert!(s.subscription(Direction::Deletion, id).await.unwrap().is_none());
}

#[tokio::test]
async fn purge_cancelled_skips_rows_with_tasks() {
  let s = store().await;
  let a = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  let b = subscribed(
    s.subscribe(Direction::Transfer, FileRef::new("/store/b.root", 200), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.create_batch(Direction::Transfer, vec![new_task(b, Some("T1_DISK"))])
    .await
    .unwrap();
  for id in [a, b] {
    s.set_status(Direction::Transfer, id, Status::New, Status::Cancelled)
      .await
      .unwrap();
  }

  assert_eq!(s.purge_cancelled(Direction::Transfer).await.unwrap(), 1);
  assert!(s.subscription(Direction::Transfer, a).await.unwrap().is_none());
  assert!(s.subscription(Direction::Transfer, b).await.unwrap().is_some());
}

// ─── Tasks and batches ───────────────────────────────────────────────────────

#[tokio::test]
async fn create_batch_returns_records_in_input_order() {
  let s = store().await;
  let a = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  let b = subscribed(
    s.subscribe(Direction::Transfer, FileRef::new("/store/b.root", 200), "T3_DEST".into())
      .await
      .unwrap(),
  );

  let (batch, records) = s
    .create_batch(
      Direction::Transfer,
      vec![new_task(a, Some("T1_DISK")), new_task(b, Some("T1_TAPE"))],
    )
    .await
    .unwrap();

  assert_eq!(records.len(), 2);
  assert_eq!(records[0].subscription_id, a);
  assert_eq!(records[0].source.as_deref(), Some("T1_DISK"));
  assert_eq!(records[1].subscription_id, b);
  assert!(records.iter().all(|r| r.batch_id == batch.id));

  let listed = s.tasks(Direction::Transfer, batch.id).await.unwrap();
  assert_eq!(listed, records);
  let one = s.task(Direction::Transfer, records[1].id).await.unwrap();
  assert_eq!(one.as_ref(), Some(&records[1]));

  let batches = s.batches(Direction::Transfer).await.unwrap();
  assert_eq!(batches.len(), 1);
  assert_eq!(batches[0].id, batch.id);
}

#[tokio::test]
async fn second_task_for_same_subscription_is_rejected() {
  let s = store().await;
  let a = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.create_batch(Direction::Transfer, vec![new_task(a, Some("T1_DISK"))])
    .await
    .unwrap();

  let dup = s
    .create_batch(Direction::Transfer, vec![new_task(a, Some("T1_TAPE"))])
    .await;
  assert!(dup.is_err());
  // The failed transaction left no empty batch behind.
  assert_eq!(s.batches(Direction::Transfer).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deletion_tasks_have_no_source() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Deletion, file_a(), "T1_DISK".into())
      .await
      .unwrap(),
  );
  let (_, records) = s
    .create_batch(Direction::Deletion, vec![new_task(id, None)])
    .await
    .unwrap();
  assert_eq!(records[0].source, None);
  assert_eq!(records[0].direction, Direction::Deletion);
}

#[tokio::test]
async fn tasks_in_status_follows_subscription() {
  let s = store().await;
  let a = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.create_batch(Direction::Transfer, vec![new_task(a, Some("T1_DISK"))])
    .await
    .unwrap();

  let unconfirmed = s
    .tasks_in_status(Direction::Transfer, Status::ACTIONABLE.to_vec())
    .await
    .unwrap();
  assert_eq!(unconfirmed.len(), 1);

  s.set_status(Direction::Transfer, a, Status::New, Status::InBatch)
    .await
    .unwrap();
  let unconfirmed = s
    .tasks_in_status(Direction::Transfer, Status::ACTIONABLE.to_vec())
    .await
    .unwrap();
  assert!(unconfirmed.is_empty());
}

#[tokio::test]
async fn delete_batch_if_empty_keeps_occupied_batch() {
  let s = store().await;
  let a = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  let (batch, _) = s
    .create_batch(Direction::Transfer, vec![new_task(a, Some("T1_DISK"))])
    .await
    .unwrap();
  assert!(!s.delete_batch_if_empty(Direction::Transfer, batch.id).await.unwrap());
}

// ─── Pre-subscriptions ───────────────────────────────────────────────────────

#[tokio::test]
async fn defer_replaces_opposite_intent() {
  let s = store().await;
  let first = s
    .defer(Direction::Transfer, "/store/new.root".into(), "T3_DEST".into())
    .await
    .unwrap()
    .unwrap();
  let again = s
    .defer(Direction::Transfer, "/store/new.root".into(), "T3_DEST".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(first.id, again.id);

  let flipped = s
    .defer(Direction::Deletion, "/store/new.root".into(), "T3_DEST".into())
    .await
    .unwrap()
    .unwrap();

  let pending = s.pre_subscriptions().await.unwrap();
  assert_eq!(pending, vec![flipped.clone()]);
  assert_eq!(flipped.direction, Direction::Deletion);

  s.delete_pre_subscription(flipped.id).await.unwrap();
  assert!(s.pre_subscriptions().await.unwrap().is_empty());
}

// ─── Directory cleanup ───────────────────────────────────────────────────────

#[tokio::test]
async fn cleanup_candidates_deduplicate_and_drain() {
  let s = store().await;
  let c = DirCleanupCandidate {
    site:      "T1_DISK".into(),
    directory: "/store".into(),
  };
  let added = s
    .add_dir_cleanup_candidates(vec![c.clone(), c.clone()])
    .await
    .unwrap();
  assert_eq!(added, 1);
  assert_eq!(
    s.add_dir_cleanup_candidates(vec![c.clone()]).await.unwrap(),
    0
  );

  assert_eq!(s.take_dir_cleanup_candidates().await.unwrap(), vec![c]);
  assert!(s.take_dir_cleanup_candidates().await.unwrap().is_empty());
}

// ─── Inventory ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn find_file_and_site() {
  let s = store().await;
  seed(&s).await;

  assert_eq!(s.find_file("/store/a.root").await.unwrap(), Some(file_a()));
  assert_eq!(s.find_file("/store/zzz.root").await.unwrap(), None);
  assert!(s.site_exists("T3_DEST").await.unwrap());
  assert!(!s.site_exists("T9_NOWHERE").await.unwrap());
}

#[tokio::test]
async fn replica_state_distinguishes_block_and_file() {
  let s = store().await;
  seed(&s).await;

  assert_eq!(
    s.replica_state("/store/a.root", "T1_DISK").await.unwrap(),
    ReplicaState::FilePresent
  );
  assert_eq!(
    s.replica_state("/store/a.root", "T2_DOWN").await.unwrap(),
    ReplicaState::FilePresent
  );
  assert_eq!(
    s.replica_state("/store/b.root", "T2_DOWN").await.unwrap(),
    ReplicaState::FileMissing
  );
  assert_eq!(
    s.replica_state("/store/a.root", "T3_DEST").await.unwrap(),
    ReplicaState::NoBlockReplica
  );
}

#[tokio::test]
async fn source_candidates_report_storage_and_readiness() {
  let s = store().await;
  seed(&s).await;

  let a = s.source_candidates("/store/a.root").await.unwrap();
  let names: Vec<_> = a.iter().map(|c| c.name.as_str()).collect();
  assert_eq!(names, vec!["T1_DISK", "T1_TAPE", "T2_DOWN"]);
  assert_eq!(a[1].storage, StorageClass::Tape);
  assert!(a[0].ready);
  assert!(!a[2].ready);

  // The incomplete replica at T2_DOWN does not hold b.root.
  let b = s.source_candidates("/store/b.root").await.unwrap();
  assert_eq!(b.len(), 2);
  assert!(b.iter().all(|c| c.name != "T2_DOWN"));
}

// ─── Read-only mode ──────────────────────────────────────────────────────────

#[tokio::test]
async fn read_only_store_writes_nothing() {
  let s = store().await;
  let id = subscribed(
    s.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
  );
  s.add_dir_cleanup_candidates(vec![DirCleanupCandidate {
    site:      "T1_DISK".into(),
    directory: "/store".into(),
  }])
  .await
  .unwrap();

  let ro = s.clone().with_read_only(true);
  assert!(ro.is_read_only());

  assert_eq!(
    ro.subscribe(Direction::Transfer, FileRef::new("/store/b.root", 200), "T3_DEST".into())
      .await
      .unwrap(),
    SubscribeOutcome::ReadOnly
  );
  assert_eq!(
    ro.subscribe(Direction::Transfer, file_a(), "T3_DEST".into())
      .await
      .unwrap(),
    SubscribeOutcome::AlreadyLive(id)
  );
  // A desubscription in read-only mode must not cancel the transfer.
  ro.subscribe(Direction::Deletion, file_a(), "T3_DEST".into())
    .await
    .unwrap();
  assert!(
    !ro.set_status(Direction::Transfer, id, Status::New, Status::Done)
      .await
      .unwrap()
  );
  assert!(
    ro.defer(Direction::Transfer, "/x".into(), "T3_DEST".into())
      .await
      .unwrap()
      .is_none()
  );
  let (_, records) = ro
    .create_batch(Direction::Transfer, vec![new_task(id, Some("T1_DISK"))])
    .await
    .unwrap();
  assert!(records.is_empty());

  // Reads still work, and taking candidates leaves them in place.
  assert_eq!(ro.take_dir_cleanup_candidates().await.unwrap().len(), 1);
  assert_eq!(ro.take_dir_cleanup_candidates().await.unwrap().len(), 1);

  let sub = s.subscription(Direction::Transfer, id).await.unwrap().unwrap();
  assert_eq!(sub.status, Status::New);
  assert!(s.batches(Direction::Transfer).await.unwrap().is_empty());
  assert!(
    s.subscriptions(Direction::Deletion, Status::LIVE.to_vec())
      .await
      .unwrap()
      .is_empty()
  );
}

// ─── History ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn history_archives_per_direction() {
  let h = SqliteHistory::open_in_memory().await.expect("in-memory history");
  let now = Utc::now();

  h.record_completion(CompletionRecord {
    direction:   Direction::Transfer,
    file_name:   "/store/a.root".into(),
    file_size:   100,
    source_site: Some("T1_DISK".into()),
    site:        "T3_DEST".into(),
    exitcode:    0,
    batch_id:    4,
    created_at:  now,
    started_at:  Some(now),
    finished_at: None,
  })
  .await
  .unwrap();
  h.record_completion(CompletionRecord {
    direction:   Direction::Deletion,
    file_name:   "/store/b.root".into(),
    file_size:   200,
    source_site: None,
    site:        "T1_DISK".into(),
    exitcode:    2,
    batch_id:    7,
    created_at:  now,
    started_at:  None,
    finished_at: None,
  })
  .await
  .unwrap();

  let transfers = h.completions(Direction::Transfer).await.unwrap();
  assert_eq!(transfers.len(), 1);
  assert_eq!(transfers[0].source_site.as_deref(), Some("T1_DISK"));
  assert_eq!(transfers[0].site, "T3_DEST");
  assert!(transfers[0].started_at.is_some());

  let deletions = h.completions(Direction::Deletion).await.unwrap();
  assert_eq!(deletions.len(), 1);
  assert_eq!(deletions[0].exitcode, 2);
  assert_eq!(deletions[0].source_site, None);
  assert_eq!(deletions[0].batch_id, 7);
}
