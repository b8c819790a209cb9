//! Ticketing error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use turnstile_core::DomainError;

pub type TicketingResult<T> = Result<T, TicketingError>;

/// Why a purchase was not admitted.
///
/// These are expected, user-facing outcomes rather than faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The event is unpublished, canceled or unknown.
    EventUnavailable,
    /// The ticket type is unknown or belongs to another event.
    InvalidTicketType,
    /// The sale window does not contain the current instant.
    NotOnSale,
    /// Every unit is committed to a pending or confirmed order.
    SoldOut,
}

impl DenialReason {
    pub fn code(self) -> &'static str {
        match self {
            DenialReason::EventUnavailable => "event_unavailable",
            DenialReason::InvalidTicketType => "invalid_ticket_type",
            DenialReason::NotOnSale => "not_on_sale",
            DenialReason::SoldOut => "sold_out",
        }
    }
}

impl core::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors raised by the ticketing aggregates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketingError {
    /// A purchase was not admitted (capacity / availability).
    #[error("order denied: {0}")]
    Denied(DenialReason),

    /// Cancel was requested for an order that is already canceled.
    #[error("order is already canceled")]
    AlreadyCanceled,

    /// Refund preconditions do not hold.
    #[error("not refundable: {0}")]
    NotRefundable(String),

    /// The requested transition is not legal from the current state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl TicketingError {
    pub fn not_refundable(msg: impl Into<String>) -> Self {
        Self::NotRefundable(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TicketingError::Denied(reason) => reason.code(),
            TicketingError::AlreadyCanceled => "already_canceled",
            TicketingError::NotRefundable(_) => "not_refundable",
            TicketingError::InvalidTransition(_) => "invalid_transition",
            TicketingError::Domain(DomainError::NotFound) => "not_found",
            TicketingError::Domain(DomainError::Conflict(_)) => "conflict",
            TicketingError::Domain(_) => "invalid_request",
        }
    }

    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            TicketingError::Denied(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<DenialReason> for TicketingError {
    fn from(value: DenialReason) -> Self {
        TicketingError::Denied(value)
    }
}
