//! Session store implementations for RelayClaw.
//!
//! [`InMemorySessionStore`] keeps transcripts for the life of the process;
//! [`SqliteSessionStore`] persists them across restarts.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemorySessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;
