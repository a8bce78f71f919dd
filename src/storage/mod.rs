//! SQLite persistence for seen-record keys, circuit-breaker state and odds snapshots.
//!
//! A dedicated writer thread owns the connection; async callers talk to it over
//! a channel and await the reply. All writes are therefore serialized and every
//! read observes the writes issued before it from this process.

pub mod schema;
pub mod types;
pub mod writer;

pub use types::{CircuitStateRecord, OddsSnapshot, PurgeStats};
pub use writer::{open_storage, open_storage_in_memory, Storage};
