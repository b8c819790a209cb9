//! Disposable read model storage.
//!
//! Everything stored here can be rebuilt from the event store.

pub mod store;

pub use store::{InMemoryReadStore, ReadStore};
