//! Projection implementations (read model builders).
//!
//! Projections consume committed records and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event store
//! - **Idempotent**: Safe for at-least-once delivery

pub mod order_book;

pub use order_book::{OrderBookEntry, OrderBookError, OrderBookProjection, PaymentEntry};
