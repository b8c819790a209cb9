//! Order state machine service: admission and cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use turnstile_core::{AggregateId, UserId};
use turnstile_events::{EventBus, EventEnvelope};
use turnstile_ticketing::{
    CancelOrder, CancelReason, DenialReason, EventId, OpenOrder, Order, OrderCommand, OrderId,
    OrderSnapshot, TicketTypeId, ORDER_AGGREGATE_TYPE,
};

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::command_dispatcher::{CommandDispatcher, Loaded, UnitOfWork};
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::ledger::ReservationLedger;

pub struct OrderStateMachine<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    ledger: ReservationLedger<S, B>,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
}

impl<S, B> Clone for OrderStateMachine<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            ledger: self.ledger.clone(),
            catalog: Arc::clone(&self.catalog),
            clock: Arc::clone(&self.clock),
        }
    }
}

pub(crate) fn snapshot_of(order: &Loaded<Order>) -> EngineResult<OrderSnapshot> {
    order.aggregate.snapshot().ok_or_else(EngineError::not_found)
}

impl<S, B> OrderStateMachine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: ReservationLedger::new(Arc::clone(&dispatcher)),
            dispatcher,
            catalog,
            clock,
        }
    }

    pub fn ledger(&self) -> &ReservationLedger<S, B> {
        &self.ledger
    }

    pub fn load(&self, order_id: OrderId) -> EngineResult<Loaded<Order>> {
        self.dispatcher
            .load(order_id.0, ORDER_AGGREGATE_TYPE, |id| Order::empty(OrderId::new(id)))
    }

    pub fn get(&self, order_id: OrderId) -> EngineResult<Option<OrderSnapshot>> {
        Ok(self.load(order_id)?.aggregate.snapshot())
    }

    /// Admit a purchase under a fresh order id.
    pub fn open(
        &self,
        user_id: UserId,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
    ) -> EngineResult<OrderSnapshot> {
        self.open_with_id(OrderId::new(AggregateId::new()), user_id, event_id, ticket_type_id)
    }

    /// Admit a purchase under a caller-chosen order id.
    ///
    /// A replay of the same request returns the existing order without reserving
    /// again; reusing the id for other terms is a conflict. For a new id the
    /// gates are, in order: the event accepts orders, the ticket type belongs to
    /// it, the sale window is open and a unit is free.
    /// The new order stream and the pool reservation commit together.
    pub fn open_with_id(
        &self,
        order_id: OrderId,
        user_id: UserId,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
    ) -> EngineResult<OrderSnapshot> {
        let now = self.clock.now();
        let mut order = self.load(order_id)?;
        let mut unit = UnitOfWork::new();

        // A known order id is answered from its stream alone, so a retry still
        // gets its order back after the listing has changed.
        if let Some(total_price) = order.aggregate.total_price() {
            unit.decide(
                &mut order,
                &OrderCommand::OpenOrder(OpenOrder {
                    order_id,
                    user_id,
                    event_id,
                    ticket_type_id,
                    total_price,
                    occurred_at: now,
                }),
            )?;
            debug!(order_id = %order_id, "open replayed for an existing order");
            return snapshot_of(&order);
        }

        self.catalog
            .event(event_id)?
            .filter(|listing| listing.accepts_orders())
            .ok_or(DenialReason::EventUnavailable)?;
        let ticket_type = self
            .catalog
            .ticket_type(ticket_type_id)?
            .filter(|tt| tt.event_id() == event_id)
            .ok_or(DenialReason::InvalidTicketType)?;

        unit.decide(
            &mut order,
            &OrderCommand::OpenOrder(OpenOrder {
                order_id,
                user_id,
                event_id,
                ticket_type_id,
                total_price: ticket_type.unit_price(),
                occurred_at: now,
            }),
        )?;

        let mut pool = self.ledger.load_pool(ticket_type_id)?;
        self.ledger
            .try_reserve(&mut unit, &mut pool, &ticket_type, order_id, now)?;
        self.dispatcher.commit(unit)?;

        info!(
            order_id = %order_id,
            user_id = %user_id,
            ticket_type_id = %ticket_type_id,
            committed = pool.aggregate.committed_units(),
            capacity = ticket_type.capacity(),
            "order opened"
        );
        snapshot_of(&order)
    }

    /// Cancel a pending or confirmed order, releasing its unit.
    pub fn cancel(&self, order_id: OrderId) -> EngineResult<OrderSnapshot> {
        let now = self.clock.now();
        let mut order = self.load(order_id)?;
        let mut unit = UnitOfWork::new();
        self.stage_cancel(&mut unit, &mut order, CancelReason::Requested, now)?;
        self.dispatcher.commit(unit)?;

        info!(order_id = %order_id, "order canceled");
        snapshot_of(&order)
    }

    /// Stage the cancellation and the matching pool release.
    pub(crate) fn stage_cancel(
        &self,
        unit: &mut UnitOfWork,
        order: &mut Loaded<Order>,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let order_id = order.aggregate.id_typed();
        unit.decide(
            order,
            &OrderCommand::CancelOrder(CancelOrder {
                order_id,
                reason,
                occurred_at: now,
            }),
        )?;
        let ticket_type_id = order
            .aggregate
            .ticket_type_id()
            .ok_or_else(EngineError::not_found)?;
        self.ledger.release(unit, ticket_type_id, order_id, now)
    }
}
