//! Append-only event store boundary.
//!
//! Streams are keyed by aggregate id and tagged with an aggregate type. The one
//! write primitive is an atomic multi-stream commit with per-stream optimistic
//! version checks.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
