//! Core types and trait definitions for the reliable file-operation state
//! machine (RLFSM).
//!
//! This crate is deliberately free of database and runtime dependencies. The
//! SQLite ledger, the engine, and the daemon all depend on it; it depends on
//! nothing proprietary.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod backend;
pub mod error;
pub mod history;
pub mod inventory;
pub mod ledger;
pub mod subscription;
pub mod task;

pub use error::{Error, Result};
