//! Read-only [`Inventory`] view over the inventory tables that share the
//! ledger database.

use rusqlite::{OptionalExtension as _, params};

use rlfsm_core::{
  inventory::{Inventory, ReplicaState, SourceSite, StorageClass},
  subscription::FileRef,
};

use crate::{Result, SqliteStore, encode::decode_size};

impl Inventory for SqliteStore {
  type Error = crate::Error;

  async fn find_file(&self, name: &str) -> Result<Option<FileRef>> {
    let name = name.to_owned();
    let row: Option<(String, i64)> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT name, size FROM files WHERE name = ?1",
            params![name],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?)
      })
      .await?;

    row
      .map(|(name, size)| {
        let size = decode_size(&name, size)?;
        Ok(FileRef::new(name, size))
      })
      .transpose()
  }

  async fn site_exists(&self, name: &str) -> Result<bool> {
    let name = name.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT 1 FROM sites WHERE name = ?1",
            params![name],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false))
      })
      .await?;
    Ok(exists)
  }

  async fn replica_state(&self, file: &str, site: &str) -> Result<ReplicaState> {
    let file = file.to_owned();
    let site = site.to_owned();
    let row: Option<(bool, bool)> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT br.is_complete,
                    EXISTS (SELECT 1 FROM block_replica_files brf
                            WHERE brf.block_name = br.block_name
                              AND brf.site_name  = br.site_name
                              AND brf.file_name  = f.name)
             FROM files f
             JOIN block_replicas br ON br.block_name = f.block_name
             WHERE f.name = ?1 AND br.site_name = ?2",
            params![file, site],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?)
      })
      .await?;

    Ok(match row {
      None => ReplicaState::NoBlockReplica,
      Some((complete, listed)) if complete || listed => ReplicaState::FilePresent,
      Some(_) => ReplicaState::FileMissing,
    })
  }

  async fn source_candidates(&self, file: &str) -> Result<Vec<SourceSite>> {
    let file = file.to_owned();
    let rows: Vec<(String, String, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT s.name, s.storage_type, s.status
           FROM files f
           JOIN block_replicas br ON br.block_name = f.block_name
           JOIN sites s           ON s.name        = br.site_name
           WHERE f.name = ?1
             AND (br.is_complete = 1
                  OR EXISTS (SELECT 1 FROM block_replica_files brf
                             WHERE brf.block_name = br.block_name
                               AND brf.site_name  = br.site_name
                               AND brf.file_name  = f.name))
           ORDER BY s.name",
        )?;
        let rows = stmt
          .query_map(params![file], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    rows
      .into_iter()
      .map(|(name, storage, status)| {
        Ok(SourceSite {
          name,
          storage: StorageClass::parse(&storage)?,
          ready: status == "ready",
        })
      })
      .collect()
  }
}
