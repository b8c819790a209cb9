//! Read-only snapshots of catalog data the engine consumes.
//!
//! Ticket types and events are owned by the organizer-facing catalog. The
//! engine only ever sees immutable snapshots loaded at decision time.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use turnstile_core::{AggregateId, DomainError, DomainResult};

/// Identifier of a ticketed event (the happening, not a domain event).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub AggregateId);

impl EventId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for EventId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Ticket type identifier. Also identifies the ticket type's reservation pool stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketTypeId(pub AggregateId);

impl TicketTypeId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TicketTypeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Half-open interval `[starts_at, ends_at)` during which units may be reserved.
///
/// A missing bound never excludes an instant.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleWindow {
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
}

impl SaleWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(
        starts_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
    ) -> DomainResult<Self> {
        if let (Some(start), Some(end)) = (starts_at, ends_at) {
            if end < start {
                return Err(DomainError::validation(
                    "sale window end must not precede its start",
                ));
            }
        }
        Ok(Self { starts_at, ends_at })
    }

    pub fn starts_at(&self) -> Option<DateTime<Utc>> {
        self.starts_at
    }

    pub fn ends_at(&self) -> Option<DateTime<Utc>> {
        self.ends_at
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let started = self.starts_at.map_or(true, |start| now >= start);
        let not_ended = self.ends_at.map_or(true, |end| now < end);
        started && not_ended
    }
}

/// Snapshot of one sellable ticket type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketType {
    id: TicketTypeId,
    event_id: EventId,
    name: String,
    unit_price: Decimal,
    capacity: u32,
    sale_window: SaleWindow,
    is_vip: bool,
}

impl TicketType {
    pub fn new(
        id: TicketTypeId,
        event_id: EventId,
        name: impl Into<String>,
        unit_price: Decimal,
        capacity: u32,
    ) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if unit_price.is_sign_negative() {
            return Err(DomainError::validation("unit_price cannot be negative"));
        }
        if capacity == 0 {
            return Err(DomainError::validation("capacity must be positive"));
        }
        Ok(Self {
            id,
            event_id,
            name,
            unit_price,
            capacity,
            sale_window: SaleWindow::unbounded(),
            is_vip: false,
        })
    }

    pub fn with_sale_window(mut self, sale_window: SaleWindow) -> Self {
        self.sale_window = sale_window;
        self
    }

    pub fn with_vip(mut self, is_vip: bool) -> Self {
        self.is_vip = is_vip;
        self
    }

    /// Organizer capacity edit. Lowering it below the committed count never
    /// evicts existing orders; it only blocks new reservations.
    pub fn set_capacity(&mut self, capacity: u32) {
        self.capacity = capacity;
    }

    pub fn set_sale_window(&mut self, sale_window: SaleWindow) {
        self.sale_window = sale_window;
    }

    pub fn id(&self) -> TicketTypeId {
        self.id
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn sale_window(&self) -> SaleWindow {
        self.sale_window
    }

    pub fn is_vip(&self) -> bool {
        self.is_vip
    }

    pub fn is_on_sale(&self, now: DateTime<Utc>) -> bool {
        self.sale_window.contains(now)
    }
}

/// Snapshot of the publish/cancel flags of an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventListing {
    id: EventId,
    is_published: bool,
    is_canceled: bool,
}

impl EventListing {
    pub fn new(id: EventId, is_published: bool, is_canceled: bool) -> Self {
        Self {
            id,
            is_published,
            is_canceled,
        }
    }

    pub fn published(id: EventId) -> Self {
        Self::new(id, true, false)
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn is_published(&self) -> bool {
        self.is_published
    }

    pub fn is_canceled(&self) -> bool {
        self.is_canceled
    }

    pub fn accepts_orders(&self) -> bool {
        self.is_published && !self.is_canceled
    }
}
