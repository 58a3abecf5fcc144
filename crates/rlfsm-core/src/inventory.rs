//! The `Inventory` trait — read access to the replica catalog.
//!
//! The inventory decides which sites exist, which files exist, and where
//! replicas of them live. This crate only ever reads it.

use std::future::Future;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result, subscription::FileRef};

/// Storage tier of a site.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StorageClass {
  Disk,
  Tape,
}

impl StorageClass {
  pub fn parse(s: &str) -> Result<Self> {
    s.parse().map_err(|_| Error::UnknownStorageClass(s.to_owned()))
  }
}

/// A site holding a full copy of some file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSite {
  pub name:    String,
  pub storage: StorageClass,
  /// Whether the site is operational and may serve transfers.
  pub ready:   bool,
}

/// What a site holds of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
  /// The site has no replica of the owning block at all.
  NoBlockReplica,
  /// The block replica exists but does not contain the file.
  FileMissing,
  FilePresent,
}

/// Read-only view of the inventory catalog.
pub trait Inventory: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Resolve a logical file name. Returns `None` if the file is unknown.
  fn find_file<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<Option<FileRef>, Self::Error>> + Send + 'a;

  /// Whether `name` is a known site.
  fn site_exists<'a>(
    &'a self,
    name: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// What `site` holds of `file`.
  fn replica_state<'a>(
    &'a self,
    file: &'a str,
    site: &'a str,
  ) -> impl Future<Output = Result<ReplicaState, Self::Error>> + Send + 'a;

  /// Every site holding a full copy of `file`, ready or not.
  fn source_candidates<'a>(
    &'a self,
    file: &'a str,
  ) -> impl Future<Output = Result<Vec<SourceSite>, Self::Error>> + Send + 'a;
}
