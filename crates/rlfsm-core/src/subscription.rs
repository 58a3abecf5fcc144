//! Subscriptions — persisted intents that a file should (transfer) or should
//! not (deletion) have a replica at a site.
//!
//! Both directions share one [`Status`] type but live in separate tables; the
//! [`Direction`] is carried explicitly on every value so that nothing relies
//! on table identity alone.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{Error, Result};

pub type SubscriptionId = i64;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Where a subscription is in its lifecycle.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
  /// Freshly created; never attempted.
  New,
  /// Attempted before and eligible for another attempt.
  Retry,
  /// Bound to a task the backend accepted.
  InBatch,
  /// Automatic retry has given up; needs an operator.
  Held,
  /// Withdrawn. Deleted once no task references it any more.
  Cancelled,
  /// Satisfied. Deleted once the consumer acknowledges it.
  Done,
}

impl Status {
  /// Statuses counted by the one-live-subscription-per-(file, site) rule.
  pub const LIVE: [Status; 4] =
    [Status::New, Status::Retry, Status::InBatch, Status::Held];

  /// Statuses the cycle picks up for submission.
  pub const ACTIONABLE: [Status; 2] = [Status::New, Status::Retry];

  pub fn is_live(self) -> bool { Self::LIVE.contains(&self) }

  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Cancelled | Self::Done)
  }

  pub fn parse(s: &str) -> Result<Self> {
    s.parse().map_err(|_| Error::UnknownStatus(s.to_owned()))
  }
}

// ─── Direction ───────────────────────────────────────────────────────────────

/// Which kind of file operation a subscription asks for.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
  Transfer,
  Deletion,
}

impl Direction {
  /// Processing order within one cycle pass.
  pub const ALL: [Direction; 2] = [Direction::Transfer, Direction::Deletion];

  pub fn opposite(self) -> Self {
    match self {
      Self::Transfer => Self::Deletion,
      Self::Deletion => Self::Transfer,
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    s.parse().map_err(|_| Error::UnknownDirection(s.to_owned()))
  }
}

// ─── Files ───────────────────────────────────────────────────────────────────

/// A block-owning file, identified by its logical name and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
  /// Logical file name, e.g. `/store/data/run1/file.root`.
  pub name: String,
  pub size: u64,
}

impl FileRef {
  pub fn new(name: impl Into<String>, size: u64) -> Self {
    Self { name: name.into(), size }
  }

  /// The directory holding this file at any site.
  pub fn directory(&self) -> &str {
    match self.name.rsplit_once('/') {
      Some(("", _)) => "/",
      Some((dir, _)) => dir,
      None => "",
    }
  }
}

// ─── Subscription ────────────────────────────────────────────────────────────

/// A transfer subscription or a deletion desubscription.
///
/// Only `id`, `status`, `file`, `site` and the two timestamps are persisted.
/// The source fields are computed when the subscription is read for
/// submission and are always empty for deletions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
  pub id:             SubscriptionId,
  pub direction:      Direction,
  pub status:         Status,
  pub file:           FileRef,
  /// Destination for a transfer; the site to remove from for a deletion.
  pub site:           String,
  pub created_at:     DateTime<Utc>,
  pub last_update:    DateTime<Utc>,
  /// Ready disk sites holding the file.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub disk_sources:   Vec<String>,
  /// Ready tape sites holding the file.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tape_sources:   Vec<String>,
  /// Source site → exit codes of past failed attempts, oldest first.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub failed_sources: BTreeMap<String, Vec<i32>>,
}

impl Subscription {
  pub fn has_sources(&self) -> bool {
    !self.disk_sources.is_empty() || !self.tape_sources.is_empty()
  }
}

/// What a subscribe or desubscribe call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum SubscribeOutcome {
  /// A new subscription row was created.
  Subscribed(SubscriptionId),
  /// A live subscription of the same direction already existed.
  AlreadyLive(SubscriptionId),
  /// File or site unknown to the inventory; recorded as a pre-subscription.
  Deferred(i64),
  /// The store is read-only; nothing was written.
  ReadOnly,
}

// ─── Deferred and derived records ────────────────────────────────────────────

/// An intent whose file or site the inventory does not know yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreSubscription {
  pub id:         i64,
  pub direction:  Direction,
  pub file_name:  String,
  pub site_name:  String,
  pub created_at: DateTime<Utc>,
}

/// One failed transfer attempt from a given source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedAttempt {
  pub subscription_id: SubscriptionId,
  pub source_site:     String,
  pub exitcode:        i32,
}

/// A directory that may have become empty after a completed deletion.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DirCleanupCandidate {
  pub site:      String,
  pub directory: String,
}

impl DirCleanupCandidate {
  /// The candidate left behind by a completed deletion.
  pub fn for_deletion(subscription: &Subscription) -> Self {
    Self {
      site:      subscription.site.clone(),
      directory: subscription.file.directory().to_owned(),
    }
  }
}
