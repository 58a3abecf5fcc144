//! SQL schema for the RLFSM SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` records the
//! schema revision; future migrations will be gated on it.

use rlfsm_core::subscription::Direction;

/// Full ledger + inventory DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- ── Inventory ──────────────────────────────────────────────────────────────
-- Owned and written by the inventory service. Read-only from here.

CREATE TABLE IF NOT EXISTS sites (
    name         TEXT PRIMARY KEY,
    storage_type TEXT NOT NULL DEFAULT 'disk',   -- 'disk' | 'tape'
    status       TEXT NOT NULL DEFAULT 'ready'   -- 'ready' | 'waitroom' | 'morgue' | ...
);

CREATE TABLE IF NOT EXISTS files (
    name       TEXT PRIMARY KEY,
    block_name TEXT NOT NULL,
    size       INTEGER NOT NULL
);

-- A site's copy of a block. Incomplete replicas list the files they hold in
-- block_replica_files.
CREATE TABLE IF NOT EXISTS block_replicas (
    block_name  TEXT NOT NULL,
    site_name   TEXT NOT NULL,
    is_complete INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (block_name, site_name)
);

CREATE TABLE IF NOT EXISTS block_replica_files (
    block_name TEXT NOT NULL,
    site_name  TEXT NOT NULL,
    file_name  TEXT NOT NULL,
    PRIMARY KEY (block_name, site_name, file_name)
);

-- ── Subscriptions ──────────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS transfer_subscriptions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name   TEXT NOT NULL,
    file_size   INTEGER NOT NULL,
    site_name   TEXT NOT NULL,    -- destination
    status      TEXT NOT NULL,    -- new | retry | inbatch | held | cancelled | done
    created_at  TEXT NOT NULL,
    last_update TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deletion_subscriptions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name   TEXT NOT NULL,
    file_size   INTEGER NOT NULL,
    site_name   TEXT NOT NULL,    -- site to delete from
    status      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    last_update TEXT NOT NULL
);

-- At most one live subscription per (file, site) and direction.
CREATE UNIQUE INDEX IF NOT EXISTS transfer_subscriptions_live_idx
    ON transfer_subscriptions(file_name, site_name)
    WHERE status IN ('new', 'retry', 'inbatch', 'held');
CREATE UNIQUE INDEX IF NOT EXISTS deletion_subscriptions_live_idx
    ON deletion_subscriptions(file_name, site_name)
    WHERE status IN ('new', 'retry', 'inbatch', 'held');
CREATE INDEX IF NOT EXISTS transfer_subscriptions_status_idx
    ON transfer_subscriptions(status);
CREATE INDEX IF NOT EXISTS deletion_subscriptions_status_idx
    ON deletion_subscriptions(status);

-- One row per failed transfer attempt; insertion order is attempt order.
CREATE TABLE IF NOT EXISTS failed_transfers (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL
                    REFERENCES transfer_subscriptions(id) ON DELETE CASCADE,
    source_site     TEXT NOT NULL,
    exitcode        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS failed_transfers_subscription_idx
    ON failed_transfers(subscription_id);

CREATE TABLE IF NOT EXISTS pre_subscriptions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name  TEXT NOT NULL,
    site_name  TEXT NOT NULL,
    direction  TEXT NOT NULL,     -- transfer | deletion
    created_at TEXT NOT NULL,
    UNIQUE (file_name, site_name, direction)
);

-- ── Execution ledger ───────────────────────────────────────────────────────

CREATE TABLE IF NOT EXISTS transfer_batches (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deletion_batches (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL
);

-- UNIQUE (subscription_id): never more than one task in flight per
-- subscription.
CREATE TABLE IF NOT EXISTS transfer_tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL UNIQUE
                    REFERENCES transfer_subscriptions(id),
    source_site     TEXT NOT NULL,
    batch_id        INTEGER NOT NULL REFERENCES transfer_batches(id),
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deletion_tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    subscription_id INTEGER NOT NULL UNIQUE
                    REFERENCES deletion_subscriptions(id),
    batch_id        INTEGER NOT NULL REFERENCES deletion_batches(id),
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS transfer_tasks_batch_idx ON transfer_tasks(batch_id);
CREATE INDEX IF NOT EXISTS deletion_tasks_batch_idx ON deletion_tasks(batch_id);

-- Directories that may be empty after a completed deletion.
CREATE TABLE IF NOT EXISTS directory_cleaning_tasks (
    site_name TEXT NOT NULL,
    directory TEXT NOT NULL,
    PRIMARY KEY (site_name, directory)
);

PRAGMA user_version = 1;
";

/// DDL for the history database.
pub const HISTORY_SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS file_transfers (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name    TEXT NOT NULL,
    file_size    INTEGER NOT NULL,
    source_site  TEXT NOT NULL,
    destination  TEXT NOT NULL,
    exitcode     INTEGER NOT NULL,
    batch_id     INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    finished_at  TEXT
);

CREATE TABLE IF NOT EXISTS file_deletions (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name    TEXT NOT NULL,
    file_size    INTEGER NOT NULL,
    site_name    TEXT NOT NULL,
    exitcode     INTEGER NOT NULL,
    batch_id     INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    finished_at  TEXT
);

CREATE INDEX IF NOT EXISTS file_transfers_file_idx ON file_transfers(file_name);
CREATE INDEX IF NOT EXISTS file_deletions_file_idx ON file_deletions(file_name);

PRAGMA user_version = 1;
";

/// Table names for one direction.
#[derive(Debug, Clone, Copy)]
pub struct Tables {
  pub subscriptions: &'static str,
  pub tasks:         &'static str,
  pub batches:       &'static str,
  /// Expression selecting the source of a task row aliased `t`.
  source_column:     &'static str,
}

impl Tables {
  /// Column list for a task row aliased `t`, in [`RawTask`] order.
  ///
  /// [`RawTask`]: crate::encode::RawTask
  pub fn task_columns(&self) -> String {
    format!(
      "t.id, t.subscription_id, {}, t.batch_id, t.created_at",
      self.source_column
    )
  }
}

pub fn tables(direction: Direction) -> Tables {
  match direction {
    Direction::Transfer => Tables {
      subscriptions: "transfer_subscriptions",
      tasks:         "transfer_tasks",
      batches:       "transfer_batches",
      source_column: "t.source_site",
    },
    Direction::Deletion => Tables {
      subscriptions: "deletion_subscriptions",
      tasks:         "deletion_tasks",
      batches:       "deletion_batches",
      source_column: "NULL",
    },
  }
}
