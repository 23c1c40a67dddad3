//! keyspace-storage: durable single-node storage.
//!
//! The [`wal`] module is the append-only log; [`engine`] combines it with
//! the in-memory map and enforces last-writer-wins ordering. All writes
//! reach the WAL before the map, so a crash loses at most the torn tail
//! of the log.

pub mod engine;
pub mod wal;

pub use engine::{StorageEngine, StorageError};
pub use wal::{Wal, WalEntry, WalError, WalOp};
