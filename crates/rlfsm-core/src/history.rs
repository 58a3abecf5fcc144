//! The `History` trait — where completed operations are archived.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{subscription::Direction, task::BatchId};

/// The archived outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
  pub direction:   Direction,
  pub file_name:   String,
  pub file_size:   u64,
  /// Transfer source; `None` for deletions.
  pub source_site: Option<String>,
  /// Transfer destination, or the site a file was deleted from.
  pub site:        String,
  pub exitcode:    i32,
  pub batch_id:    BatchId,
  pub created_at:  DateTime<Utc>,
  pub started_at:  Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// Append-only archive of completed file operations.
pub trait History: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn record_completion(
    &self,
    record: CompletionRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
