//! Service-layer error taxonomy.

use thiserror::Error;

use turnstile_core::DomainError;
use turnstile_ticketing::{DenialReason, TicketingError};

use crate::catalog::CatalogError;
use crate::event_store::EventStoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Expected, user-facing (`sold_out`, `not_on_sale`). Retrying immediately won't help.
    Capacity,
    /// Caller logic error: illegal transition, unknown resource, bad input.
    State,
    /// Lost an optimistic race; the whole operation is safe to retry.
    Consistency,
    /// Storage or collaborator failure. Nothing was written.
    Storage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ticketing(#[from] TicketingError),

    /// A stream moved between load and commit.
    #[error("consistency conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("storage failure: {0}")]
    Storage(#[source] EventStoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Ticketing(TicketingError::Denied(
                DenialReason::SoldOut | DenialReason::NotOnSale,
            )) => ErrorKind::Capacity,
            EngineError::Ticketing(_) => ErrorKind::State,
            EngineError::Conflict(_) => ErrorKind::Consistency,
            EngineError::Catalog(_) | EngineError::Storage(_) => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Consistency
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Ticketing(e) => e.code(),
            EngineError::Conflict(_) => "consistency_conflict",
            EngineError::Catalog(_) => "catalog_unavailable",
            EngineError::Storage(_) => "storage_failure",
        }
    }

    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            EngineError::Ticketing(e) => e.denial(),
            _ => None,
        }
    }

    pub fn not_found() -> Self {
        EngineError::Ticketing(DomainError::not_found().into())
    }
}

impl From<EventStoreError> for EngineError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => EngineError::Conflict(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl From<DenialReason> for EngineError {
    fn from(value: DenialReason) -> Self {
        EngineError::Ticketing(value.into())
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        EngineError::Ticketing(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_conflicts_are_retryable() {
        let conflict = EngineError::from(EventStoreError::Concurrency("stale".into()));
        assert_eq!(conflict.kind(), ErrorKind::Consistency);
        assert!(conflict.is_retryable());

        let backend = EngineError::from(EventStoreError::Backend("down".into()));
        assert_eq!(backend.kind(), ErrorKind::Storage);
        assert!(!backend.is_retryable());

        // A domain-level conflict (order id reused) is the caller's problem.
        let reuse = EngineError::from(DomainError::conflict("order id reused"));
        assert_eq!(reuse.kind(), ErrorKind::State);
        assert!(!reuse.is_retryable());
    }

    #[test]
    fn denials_split_between_capacity_and_state() {
        assert_eq!(EngineError::from(DenialReason::SoldOut).kind(), ErrorKind::Capacity);
        assert_eq!(EngineError::from(DenialReason::NotOnSale).kind(), ErrorKind::Capacity);
        assert_eq!(
            EngineError::from(DenialReason::EventUnavailable).kind(),
            ErrorKind::State
        );
        assert_eq!(EngineError::from(DenialReason::SoldOut).code(), "sold_out");
    }
}
