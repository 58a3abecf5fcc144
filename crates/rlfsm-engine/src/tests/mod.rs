//! Engine tests: a real in-memory `SqliteStore` ledger driven against
//! in-memory inventory, history and backend doubles.


use std::{
  collections::{BTreeMap, HashMap, HashSet},
  convert::Infallible,
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use chrono::Utc;
use rlfsm_core::{
  backend::OperationBackend,
  history::{CompletionRecord, History},
  inventory::{Inventory, ReplicaState, SourceSite, StorageClass},
  ledger::Ledger as _,
  subscription::{Direction, FileRef, Status, Subscription, SubscriptionId},
  task::{BatchId, OperationStatus, Task, TaskId, TaskResult},
};
use rlfsm_store_sqlite::SqliteStore;

use crate::{Rlfsm, Settings};

pub const FILE: &str = "/store/data/run1/a.root";
pub const SRC_DISK: &str = "SRC_DISK";
pub const SRC_TAPE: &str = "SRC_TAPE";
pub const DEST: &str = "DEST";

// ─── Inventory double ────────────────────────────────────────────────────────

#[derive(Default)]
struct Catalog {
  files:    HashMap<String, u64>,
  sites:    BTreeMap<String, (StorageClass, bool)>,
  replicas: HashMap<(String, String), ReplicaState>,
}

#[derive(Default)]
pub struct MemoryInventory {
  catalog: Mutex<Catalog>,
}

impl MemoryInventory {
  pub fn add_site(&self, name: &str, storage: StorageClass, ready: bool) {
    self.catalog.lock().unwrap().sites.insert(name.into(), (storage, ready));
  }

  pub fn remove_site(&self, name: &str) {
    self.catalog.lock().unwrap().sites.remove(name);
  }

  pub fn add_file(&self, name: &str, size: u64) {
    self.catalog.lock().unwrap().files.insert(name.into(), size);
  }

  pub fn remove_file(&self, name: &str) {
    self.catalog.lock().unwrap().files.remove(name);
  }

  pub fn set_replica(&self, file: &str, site: &str, state: ReplicaState) {
    self
      .catalog
      .lock()
      .unwrap()
      .replicas
      .insert((file.into(), site.into()), state);
  }
}

impl Inventory for MemoryInventory {
  type Error = Infallible;

  async fn find_file(&self, name: &str) -> Result<Option<FileRef>, Infallible> {
    let catalog = self.catalog.lock().unwrap();
    Ok(catalog.files.get(name).map(|&size| FileRef::new(name, size)))
  }

  async fn site_exists(&self, name: &str) -> Result<bool, Infallible> {
    Ok(self.catalog.lock().unwrap().sites.contains_key(name))
  }

  async fn replica_state(&self, file: &str, site: &str) -> Result<ReplicaState, Infallible> {
    let catalog = self.catalog.lock().unwrap();
    Ok(
      catalog
        .replicas
        .get(&(file.to_owned(), site.to_owned()))
        .copied()
        .unwrap_or(ReplicaState::NoBlockReplica),
    )
  }

  async fn source_candidates(&self, file: &str) -> Result<Vec<SourceSite>, Infallible> {
    let catalog = self.catalog.lock().unwrap();
    Ok(
      catalog
        .sites
        .iter()
        .filter(|(site, _)| {
          catalog.replicas.get(&(file.to_owned(), (*site).clone()))
            == Some(&ReplicaState::FilePresent)
        })
        .map(|(name, &(storage, ready))| SourceSite {
          name: name.clone(),
          storage,
          ready,
        })
        .collect(),
    )
  }
}

// ─── History double ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryHistory {
  records: Mutex<Vec<CompletionRecord>>,
}

impl MemoryHistory {
  pub fn records(&self) -> Vec<CompletionRecord> { self.records.lock().unwrap().clone() }
}

impl History for MemoryHistory {
  type Error = Infallible;

  async fn record_completion(&self, record: CompletionRecord) -> Result<(), Infallible> {
    self.records.lock().unwrap().push(record);
    Ok(())
  }
}

// ─── Backend double ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("backend unreachable")]
pub struct Unreachable;

/// A backend whose results are set by the test.
#[derive(Default)]
pub struct ScriptedBackend {
  /// Reject every submitted task.
  pub reject:        AtomicBool,
  /// Fail every call with [`Unreachable`].
  pub unreachable:   AtomicBool,
  /// Never answer `start`.
  pub hang:          AtomicBool,
  /// Keep results after `forget_result`, as a backend that lost the call would.
  pub ignore_forget: AtomicBool,
  state:             Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
  /// Every `start` call: batch id and the tasks it carried.
  started:   Vec<(BatchId, Vec<Task>)>,
  results:   BTreeMap<BatchId, BTreeMap<TaskId, TaskResult>>,
  cancelled: Vec<TaskId>,
  forgotten: HashSet<TaskId>,
  dropped:   Vec<BatchId>,
}

impl ScriptedBackend {
  fn check(&self) -> Result<(), Unreachable> {
    if self.unreachable.load(Ordering::SeqCst) { Err(Unreachable) } else { Ok(()) }
  }

  /// Every task handed to `start`, in order.
  pub fn started(&self) -> Vec<Task> {
    let state = self.state.lock().unwrap();
    state.started.iter().flat_map(|(_, t)| t.clone()).collect()
  }

  pub fn cancelled(&self) -> Vec<TaskId> { self.state.lock().unwrap().cancelled.clone() }

  pub fn forgotten(&self, task_id: TaskId) -> bool {
    self.state.lock().unwrap().forgotten.contains(&task_id)
  }

  pub fn dropped_batches(&self) -> Vec<BatchId> { self.state.lock().unwrap().dropped.clone() }

  /// Report `task_id` as finished with `status` and `exitcode`.
  pub fn finish(&self, task_id: TaskId, status: OperationStatus, exitcode: Option<i32>) {
    let now = Utc::now();
    let mut state = self.state.lock().unwrap();
    for results in state.results.values_mut() {
      if let Some(result) = results.get_mut(&task_id) {
        result.status = status;
        result.exitcode = exitcode;
        result.started_at = Some(now);
        result.finished_at = Some(now);
      }
    }
  }
}

impl OperationBackend for ScriptedBackend {
  type Error = Unreachable;

  fn form_batches(&self, tasks: Vec<Task>) -> Vec<Vec<Task>> {
    if tasks.is_empty() { Vec::new() } else { vec![tasks] }
  }

  async fn start(
    &self,
    batch_id: BatchId,
    tasks: &[Task],
  ) -> Result<HashMap<TaskId, bool>, Unreachable> {
    if self.hang.load(Ordering::SeqCst) {
      std::future::pending::<()>().await;
    }
    self.check()?;

    let accept = !self.reject.load(Ordering::SeqCst);
    let mut state = self.state.lock().unwrap();
    state.started.push((batch_id, tasks.to_vec()));
    let mut accepted = HashMap::new();
    for task in tasks {
      let Some(task_id) = task.id else { continue };
      accepted.insert(task_id, accept);
      if accept {
        state.results.entry(batch_id).or_default().insert(task_id, TaskResult {
          task_id,
          status: OperationStatus::InProgress,
          exitcode: None,
          started_at: None,
          finished_at: None,
        });
      }
    }
    Ok(accepted)
  }

  async fn get_results(&self, batch_id: BatchId) -> Result<Vec<TaskResult>, Unreachable> {
    self.check()?;
    let state = self.state.lock().unwrap();
    Ok(
      state
        .results
        .get(&batch_id)
        .map(|r| r.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn cancel(&self, task_ids: &[TaskId]) -> Result<(), Unreachable> {
    self.check()?;
    self.state.lock().unwrap().cancelled.extend_from_slice(task_ids);
    Ok(())
  }

  async fn forget_result(&self, task_id: TaskId) -> Result<(), Unreachable> {
    self.check()?;
    let mut state = self.state.lock().unwrap();
    state.forgotten.insert(task_id);
    if !self.ignore_forget.load(Ordering::SeqCst) {
      for results in state.results.values_mut() {
        results.remove(&task_id);
      }
    }
    Ok(())
  }

  async fn forget_batch(&self, batch_id: BatchId) -> Result<(), Unreachable> {
    self.check()?;
    let mut state = self.state.lock().unwrap();
    state.dropped.push(batch_id);
    if !self.ignore_forget.load(Ordering::SeqCst) {
      state.results.remove(&batch_id);
    }
    Ok(())
  }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

pub type Engine = Rlfsm<SqliteStore, MemoryInventory, MemoryHistory, ScriptedBackend>;

pub struct Harness {
  pub engine:    Engine,
  pub store:     Arc<SqliteStore>,
  pub inventory: Arc<MemoryInventory>,
  pub history:   Arc<MemoryHistory>,
}

pub fn settings() -> Settings {
  Settings {
    interval:               Duration::from_millis(10),
    backend_timeout:        Duration::from_millis(200),
    read_only:              false,
    missing_file_exitcodes: vec![2],
  }
}

/// Inventory with one file held by a ready disk site and a ready tape site,
/// and an empty replica of its block at `DEST`.
pub fn inventory() -> MemoryInventory {
  let inventory = MemoryInventory::default();
  inventory.add_site(SRC_DISK, StorageClass::Disk, true);
  inventory.add_site(SRC_TAPE, StorageClass::Tape, true);
  inventory.add_site(DEST, StorageClass::Disk, true);
  inventory.add_file(FILE, 1000);
  inventory.set_replica(FILE, SRC_DISK, ReplicaState::FilePresent);
  inventory.set_replica(FILE, SRC_TAPE, ReplicaState::FilePresent);
  inventory.set_replica(FILE, DEST, ReplicaState::FileMissing);
  inventory
}

pub async fn harness() -> Harness {
  harness_with(inventory(), settings()).await
}

pub async fn harness_with(inventory: MemoryInventory, settings: Settings) -> Harness {
  let store = Arc::new(SqliteStore::open_in_memory().await.expect("in-memory store"));
  let inventory = Arc::new(inventory);
  let history = Arc::new(MemoryHistory::default());
  let engine = Rlfsm::new(
    store.clone(),
    inventory.clone(),
    history.clone(),
    ScriptedBackend::default(),
    ScriptedBackend::default(),
    settings,
  );
  Harness { engine, store, inventory, history }
}

impl Harness {
  pub fn transfers(&self) -> &ScriptedBackend { self.engine.backend(Direction::Transfer) }

  pub fn deletions(&self) -> &ScriptedBackend { self.engine.backend(Direction::Deletion) }

  pub async fn pass(&self) { self.engine.run_once().await.expect("pass"); }

  pub async fn sub(&self, direction: Direction, id: SubscriptionId) -> Option<Subscription> {
    self.store.subscription(direction, id).await.unwrap()
  }

  pub async fn status(&self, direction: Direction, id: SubscriptionId) -> Option<Status> {
    self.sub(direction, id).await.map(|s| s.status)
  }

  /// The single task currently recorded for `direction`.
  pub async fn only_task(&self, direction: Direction) -> TaskId {
    let batches = self.store.batches(direction).await.unwrap();
    let mut tasks = Vec::new();
    for batch in batches {
      tasks.extend(self.store.tasks(direction, batch.id).await.unwrap());
    }
    assert_eq!(tasks.len(), 1, "expected exactly one task");
    tasks[0].id
  }

  pub async fn task_count(&self, direction: Direction) -> usize {
    let batches = self.store.batches(direction).await.unwrap();
    let mut count = 0;
    for batch in batches {
      count += self.store.tasks(direction, batch.id).await.unwrap().len();
    }
    count
  }
}
