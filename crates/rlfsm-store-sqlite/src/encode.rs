//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings. Enumerations are stored as
//! their lowercase names. Sizes are stored as signed 64-bit integers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rlfsm_core::{
  subscription::{Direction, FileRef, PreSubscription, Status, Subscription},
  task::{Batch, TaskRecord},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

// ─── Sizes ───────────────────────────────────────────────────────────────────

pub fn encode_size(size: u64) -> i64 { size as i64 }

pub fn decode_size(file: &str, size: i64) -> Result<u64> {
  u64::try_from(size).map_err(|_| Error::NegativeSize {
    file: file.to_owned(),
    size,
  })
}

// ─── Status lists ────────────────────────────────────────────────────────────

/// Render statuses as a SQL `IN (...)` body. Safe to splice into SQL: the
/// values come from a closed enum.
pub fn status_list(statuses: &[Status]) -> String {
  if statuses.is_empty() {
    // `IN ()` is a syntax error; match nothing instead.
    return "NULL".to_owned();
  }
  statuses
    .iter()
    .map(|s| format!("'{}'", s.as_ref()))
    .collect::<Vec<_>>()
    .join(", ")
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from a `*_subscriptions` row.
pub struct RawSubscription {
  pub id:          i64,
  pub file_name:   String,
  pub file_size:   i64,
  pub site_name:   String,
  pub status:      String,
  pub created_at:  String,
  pub last_update: String,
}

pub const SUBSCRIPTION_COLUMNS: &str =
  "id, file_name, file_size, site_name, status, created_at, last_update";

impl RawSubscription {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:          row.get(0)?,
      file_name:   row.get(1)?,
      file_size:   row.get(2)?,
      site_name:   row.get(3)?,
      status:      row.get(4)?,
      created_at:  row.get(5)?,
      last_update: row.get(6)?,
    })
  }

  pub fn into_subscription(
    self,
    direction: Direction,
    failed_sources: BTreeMap<String, Vec<i32>>,
  ) -> Result<Subscription> {
    let size = decode_size(&self.file_name, self.file_size)?;
    Ok(Subscription {
      id: self.id,
      direction,
      status: Status::parse(&self.status)?,
      file: FileRef::new(self.file_name, size),
      site: self.site_name,
      created_at: decode_dt(&self.created_at)?,
      last_update: decode_dt(&self.last_update)?,
      disk_sources: Vec::new(),
      tape_sources: Vec::new(),
      failed_sources,
    })
  }
}

/// Raw values read directly from a `*_tasks` row.
pub struct RawTask {
  pub id:              i64,
  pub subscription_id: i64,
  pub source:          Option<String>,
  pub batch_id:        i64,
  pub created_at:      String,
}

impl RawTask {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:              row.get(0)?,
      subscription_id: row.get(1)?,
      source:          row.get(2)?,
      batch_id:        row.get(3)?,
      created_at:      row.get(4)?,
    })
  }

  pub fn into_record(self, direction: Direction) -> Result<TaskRecord> {
    if direction == Direction::Transfer && self.source.is_none() {
      return Err(Error::MissingSource(self.id));
    }
    Ok(TaskRecord {
      id: self.id,
      direction,
      subscription_id: self.subscription_id,
      source: self.source,
      batch_id: self.batch_id,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values read directly from a `*_batches` row.
pub struct RawBatch {
  pub id:         i64,
  pub created_at: String,
}

impl RawBatch {
  pub fn into_batch(self, direction: Direction) -> Result<Batch> {
    Ok(Batch {
      id: self.id,
      direction,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}

/// Raw values read directly from a `pre_subscriptions` row.
pub struct RawPreSubscription {
  pub id:         i64,
  pub file_name:  String,
  pub site_name:  String,
  pub direction:  String,
  pub created_at: String,
}

impl RawPreSubscription {
  pub fn into_pre_subscription(self) -> Result<PreSubscription> {
    Ok(PreSubscription {
      id:         self.id,
      direction:  Direction::parse(&self.direction)?,
      file_name:  self.file_name,
      site_name:  self.site_name,
      created_at: decode_dt(&self.created_at)?,
    })
  }
}
