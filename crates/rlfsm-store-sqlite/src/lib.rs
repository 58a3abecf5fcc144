//! SQLite backend for the RLFSM ledger.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. The same database also carries the
//! inventory tables that [`SqliteStore`] reads through the
//! [`Inventory`](rlfsm_core::inventory::Inventory) trait. Completed operations
//! are archived by [`SqliteHistory`] into a separate database.

mod encode;
mod history;
mod inventory;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use history::SqliteHistory;
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
