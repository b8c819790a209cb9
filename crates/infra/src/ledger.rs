//! Reservation ledger: the per-ticket-type pool streams.
//!
//! The committed-unit count of a ticket type is always derived by replaying
//! its pool stream; nothing caches it. Reservation and release are staged into
//! the caller's unit of work so they commit together with the order transition
//! that caused them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use turnstile_events::{EventBus, EventEnvelope};
use turnstile_ticketing::{
    OrderId, PoolCommand, ReleaseUnit, ReserveUnit, TicketPool, TicketType, TicketTypeId,
    POOL_AGGREGATE_TYPE,
};

use crate::command_dispatcher::{CommandDispatcher, Loaded, UnitOfWork};
use crate::error::EngineResult;
use crate::event_store::EventStore;

pub struct ReservationLedger<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
}

impl<S, B> Clone for ReservationLedger<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<S, B> ReservationLedger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>) -> Self {
        Self { dispatcher }
    }

    pub fn load_pool(&self, ticket_type_id: TicketTypeId) -> EngineResult<Loaded<TicketPool>> {
        self.dispatcher.load(ticket_type_id.0, POOL_AGGREGATE_TYPE, |id| {
            TicketPool::empty(TicketTypeId::new(id))
        })
    }

    /// Orders currently holding a unit (pending or confirmed).
    pub fn count_active_for(&self, ticket_type_id: TicketTypeId) -> EngineResult<u32> {
        Ok(self.load_pool(ticket_type_id)?.aggregate.committed_units())
    }

    /// Stage a compare-and-increment on the pool.
    ///
    /// Denies with `not_on_sale` or `sold_out` against the loaded pool state. The
    /// decision only takes effect if the unit of work commits while the pool
    /// stream is still at its loaded version; a racing reservation turns the
    /// commit into a retryable conflict instead of an oversell.
    pub fn try_reserve(
        &self,
        unit: &mut UnitOfWork,
        pool: &mut Loaded<TicketPool>,
        ticket_type: &TicketType,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let cmd = PoolCommand::ReserveUnit(ReserveUnit {
            ticket_type: ticket_type.clone(),
            order_id,
            occurred_at: now,
        });
        let events = unit.decide(pool, &cmd)?;
        debug!(
            ticket_type_id = %ticket_type.id(),
            order_id = %order_id,
            reserved = !events.is_empty(),
            committed = pool.aggregate.committed_units(),
            capacity = ticket_type.capacity(),
            "reservation staged"
        );
        Ok(())
    }

    /// Load the pool and stage the release of `order_id`'s unit.
    ///
    /// Releasing an order that holds nothing stages nothing.
    pub fn release(
        &self,
        unit: &mut UnitOfWork,
        ticket_type_id: TicketTypeId,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut pool = self.load_pool(ticket_type_id)?;
        let cmd = PoolCommand::ReleaseUnit(ReleaseUnit {
            ticket_type_id,
            order_id,
            occurred_at: now,
        });
        unit.decide(&mut pool, &cmd)?;
        Ok(())
    }
}
