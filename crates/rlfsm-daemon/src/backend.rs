//! [`ConfiguredBackend`] — the operation backend selected in configuration.

use std::{collections::HashMap, convert::Infallible};

use rlfsm_core::{
  backend::OperationBackend,
  task::{BatchId, Task, TaskId, TaskResult},
};
use rlfsm_engine::dummy::DummyBackend;
use thiserror::Error;

use crate::config::BackendConfig;

#[derive(Debug, Error)]
pub enum BackendError {
  #[error(transparent)]
  Dummy(#[from] Infallible),
}

/// One of the compiled-in backends.
#[derive(Debug)]
pub enum ConfiguredBackend {
  Dummy(DummyBackend),
}

impl ConfiguredBackend {
  pub fn from_config(config: &BackendConfig) -> Self {
    match config {
      BackendConfig::Dummy(options) => Self::Dummy(DummyBackend::new(options.into())),
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::Dummy(_) => "dummy",
    }
  }
}

impl OperationBackend for ConfiguredBackend {
  type Error = BackendError;

  fn form_batches(&self, tasks: Vec<Task>) -> Vec<Vec<Task>> {
    match self {
      Self::Dummy(b) => b.form_batches(tasks),
    }
  }

  async fn start(
    &self,
    batch_id: BatchId,
    tasks: &[Task],
  ) -> Result<HashMap<TaskId, bool>, BackendError> {
    match self {
      Self::Dummy(b) => Ok(b.start(batch_id, tasks).await?),
    }
  }

  async fn get_results(&self, batch_id: BatchId) -> Result<Vec<TaskResult>, BackendError> {
    match self {
      Self::Dummy(b) => Ok(b.get_results(batch_id).await?),
    }
  }

  async fn cancel(&self, task_ids: &[TaskId]) -> Result<(), BackendError> {
    match self {
      Self::Dummy(b) => Ok(b.cancel(task_ids).await?),
    }
  }

  async fn forget_result(&self, task_id: TaskId) -> Result<(), BackendError> {
    match self {
      Self::Dummy(b) => Ok(b.forget_result(task_id).await?),
    }
  }

  async fn forget_batch(&self, batch_id: BatchId) -> Result<(), BackendError> {
    match self {
      Self::Dummy(b) => Ok(b.forget_batch(batch_id).await?),
    }
  }
}
