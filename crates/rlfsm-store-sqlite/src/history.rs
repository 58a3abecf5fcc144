//! [`SqliteHistory`] — archive of completed transfers and deletions.
//!
//! Lives in its own database file so the archive can be rotated or shipped
//! elsewhere independently of the ledger.

use std::path::Path;

use rusqlite::params;

use rlfsm_core::{
  history::{CompletionRecord, History},
  subscription::Direction,
};

use crate::{
  Result,
  encode::{decode_dt, decode_opt_dt, decode_size, encode_dt, encode_size},
  schema::HISTORY_SCHEMA,
};

/// Append-only history archive backed by SQLite.
#[derive(Clone)]
pub struct SqliteHistory {
  conn: tokio_rusqlite::Connection,
}

struct RawCompletion {
  file_name:   String,
  file_size:   i64,
  source_site: Option<String>,
  site:        String,
  exitcode:    i32,
  batch_id:    i64,
  created_at:  String,
  started_at:  Option<String>,
  finished_at: Option<String>,
}

impl SqliteHistory {
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let history = Self { conn };
    history.init_schema().await?;
    Ok(history)
  }

  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let history = Self { conn };
    history.init_schema().await?;
    Ok(history)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(HISTORY_SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Every archived record of `direction`, oldest first.
  pub async fn completions(&self, direction: Direction) -> Result<Vec<CompletionRecord>> {
    let raws: Vec<RawCompletion> = self
      .conn
      .call(move |conn| {
        let sql = match direction {
          Direction::Transfer => {
            "SELECT file_name, file_size, source_site, destination, exitcode,
                    batch_id, created_at, started_at, finished_at
             FROM file_transfers ORDER BY id"
          }
          Direction::Deletion => {
            "SELECT file_name, file_size, NULL, site_name, exitcode,
                    batch_id, created_at, started_at, finished_at
             FROM file_deletions ORDER BY id"
          }
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
          .query_map([], |row| {
            Ok(RawCompletion {
              file_name:   row.get(0)?,
              file_size:   row.get(1)?,
              source_site: row.get(2)?,
              site:        row.get(3)?,
              exitcode:    row.get(4)?,
              batch_id:    row.get(5)?,
              created_at:  row.get(6)?,
              started_at:  row.get(7)?,
              finished_at: row.get(8)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|raw| {
        Ok(CompletionRecord {
          direction,
          file_size: decode_size(&raw.file_name, raw.file_size)?,
          file_name: raw.file_name,
          source_site: raw.source_site,
          site: raw.site,
          exitcode: raw.exitcode,
          batch_id: raw.batch_id,
          created_at: decode_dt(&raw.created_at)?,
          started_at: decode_opt_dt(raw.started_at.as_deref())?,
          finished_at: decode_opt_dt(raw.finished_at.as_deref())?,
        })
      })
      .collect()
  }
}

impl History for SqliteHistory {
  type Error = crate::Error;

  async fn record_completion(&self, record: CompletionRecord) -> Result<()> {
    let size        = encode_size(record.file_size);
    let created_at  = encode_dt(record.created_at);
    let started_at  = record.started_at.map(encode_dt);
    let finished_at = record.finished_at.map(encode_dt);
    let source      = record.source_site.clone().unwrap_or_default();

    self
      .conn
      .call(move |conn| {
        match record.direction {
          Direction::Transfer => conn.execute(
            "INSERT INTO file_transfers (
               file_name, file_size, source_site, destination, exitcode,
               batch_id, created_at, started_at, finished_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
              record.file_name,
              size,
              source,
              record.site,
              record.exitcode,
              record.batch_id,
              created_at,
              started_at,
              finished_at,
            ],
          )?,
          Direction::Deletion => conn.execute(
            "INSERT INTO file_deletions (
               file_name, file_size, site_name, exitcode,
               batch_id, created_at, started_at, finished_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
              record.file_name,
              size,
              record.site,
              record.exitcode,
              record.batch_id,
              created_at,
              started_at,
              finished_at,
            ],
          )?,
        };
        Ok(())
      })
      .await?;
    Ok(())
  }
}
