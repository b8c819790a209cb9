//! `turnstile-core`: domain foundation building blocks.
//!
//! Pure domain primitives shared by the ticketing model and the infrastructure
//! that persists it. Nothing in here performs IO.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, UserId};
