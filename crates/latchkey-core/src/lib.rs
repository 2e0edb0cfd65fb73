//! Latchkey core.
//!
//! Building blocks shared by the account and contact services:
//!
//! - [`Environment`]: time and randomness, injected so tests can run against
//!   a settable clock and a seeded RNG
//! - [`model`]: contact records, key records and the typed account state
//! - [`storage`]: the [`RecordStore`] contract with in-memory, fault
//!   injecting and redb-backed implementations
//! - [`TaskSerializer`]: single-concurrency FIFO queue for operations that
//!   must never interleave
//!
//! Nothing here talks to the network. Services in `latchkey-client` compose
//! these pieces with the remote account API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod model;
pub mod serializer;
pub mod storage;
mod system_env;

pub use env::Environment;
pub use serializer::{SerializerError, TaskSerializer};
pub use storage::{ChaoticStore, MemoryStore, RecordStore, RedbStore, StoreError, StoreOp};
pub use system_env::SystemEnv;
