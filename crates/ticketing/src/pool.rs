//! Reservation pool of one ticket type.
//!
//! The pool stream is the reservation ledger: every admitted order appends a
//! `UnitReserved`, every cancellation appends a `UnitReleased`. The committed-unit
//! count is the size of the set of orders currently holding a unit, rebuilt from the
//! stream on every load. Capacity is never stored here; it is read from the
//! current `TicketType` snapshot at decision time.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use turnstile_core::{Aggregate, AggregateRoot, DomainError};
use turnstile_events::Event;

use crate::error::{DenialReason, TicketingError};
use crate::order::OrderId;
use crate::ticket_type::{TicketType, TicketTypeId};

pub const POOL_AGGREGATE_TYPE: &str = "ticketing.pool";

/// Aggregate root: TicketPool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPool {
    id: TicketTypeId,
    held: HashSet<OrderId>,
    version: u64,
}

impl TicketPool {
    /// Create an empty pool for rehydration.
    pub fn empty(id: TicketTypeId) -> Self {
        Self {
            id,
            held: HashSet::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> TicketTypeId {
        self.id
    }

    /// Number of orders currently holding a unit (pending or confirmed).
    pub fn committed_units(&self) -> u32 {
        u32::try_from(self.held.len()).unwrap_or(u32::MAX)
    }

    /// Capacity minus committed units, clamped at zero.
    ///
    /// The clamp matters after an organizer lowers capacity below the committed count.
    pub fn available_units(&self, capacity: u32) -> u32 {
        capacity.saturating_sub(self.committed_units())
    }

    pub fn holds(&self, order_id: OrderId) -> bool {
        self.held.contains(&order_id)
    }
}

impl AggregateRoot for TicketPool {
    type Id = TicketTypeId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ReserveUnit.
///
/// Carries the ticket type snapshot loaded for this decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveUnit {
    pub ticket_type: TicketType,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseUnit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseUnit {
    pub ticket_type_id: TicketTypeId,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolCommand {
    ReserveUnit(ReserveUnit),
    ReleaseUnit(ReleaseUnit),
}

/// Event: UnitReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReserved {
    pub ticket_type_id: TicketTypeId,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: UnitReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReleased {
    pub ticket_type_id: TicketTypeId,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolEvent {
    UnitReserved(UnitReserved),
    UnitReleased(UnitReleased),
}

impl Event for PoolEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PoolEvent::UnitReserved(_) => "ticketing.pool.unit_reserved",
            PoolEvent::UnitReleased(_) => "ticketing.pool.unit_released",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PoolEvent::UnitReserved(e) => e.occurred_at,
            PoolEvent::UnitReleased(e) => e.occurred_at,
        }
    }
}

impl Aggregate for TicketPool {
    type Command = PoolCommand;
    type Event = PoolEvent;
    type Error = TicketingError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PoolEvent::UnitReserved(e) => {
                self.id = e.ticket_type_id;
                self.held.insert(e.order_id);
            }
            PoolEvent::UnitReleased(e) => {
                self.held.remove(&e.order_id);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PoolCommand::ReserveUnit(cmd) => self.handle_reserve(cmd),
            PoolCommand::ReleaseUnit(cmd) => self.handle_release(cmd),
        }
    }
}

impl TicketPool {
    fn ensure_pool_id(&self, ticket_type_id: TicketTypeId) -> Result<(), DomainError> {
        if self.id != ticket_type_id {
            return Err(DomainError::invariant("ticket_type_id mismatch"));
        }
        Ok(())
    }

    fn handle_reserve(&self, cmd: &ReserveUnit) -> Result<Vec<PoolEvent>, TicketingError> {
        self.ensure_pool_id(cmd.ticket_type.id())?;

        // Replayed request: the unit is already held by this order.
        if self.holds(cmd.order_id) {
            return Ok(vec![]);
        }

        if !cmd.ticket_type.is_on_sale(cmd.occurred_at) {
            return Err(DenialReason::NotOnSale.into());
        }

        if self.available_units(cmd.ticket_type.capacity()) == 0 {
            return Err(DenialReason::SoldOut.into());
        }

        Ok(vec![PoolEvent::UnitReserved(UnitReserved {
            ticket_type_id: self.id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseUnit) -> Result<Vec<PoolEvent>, TicketingError> {
        self.ensure_pool_id(cmd.ticket_type_id)?;

        if !self.holds(cmd.order_id) {
            return Ok(vec![]);
        }

        Ok(vec![PoolEvent::UnitReleased(UnitReleased {
            ticket_type_id: self.id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
