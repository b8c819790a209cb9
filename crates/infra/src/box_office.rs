//! `BoxOffice`: the operations exposed to the API layer.
//!
//! Wires the order state machine, settlement coordinator and inventory queries
//! over one store/bus pair and retries whole operations that lose an
//! optimistic race. Every retry reloads all streams from scratch.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use turnstile_core::{AggregateId, UserId};
use turnstile_events::{EventBus, EventEnvelope};
use turnstile_ticketing::{
    EventId, OrderId, OrderSnapshot, PaymentId, PaymentMethod, PaymentSnapshot, TicketTypeId,
};

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::command_dispatcher::CommandDispatcher;
use crate::config::BoxOfficeConfig;
use crate::error::EngineResult;
use crate::event_store::EventStore;
use crate::inventory::{Availability, InventoryQueryService};
use crate::orders::OrderStateMachine;
use crate::settlement::{RecoveryReport, SettlementCoordinator, SettlementOutcome};

pub struct BoxOffice<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    orders: OrderStateMachine<S, B>,
    settlement: SettlementCoordinator<S, B>,
    inventory: InventoryQueryService<S, B>,
    max_attempts: u32,
}

impl<S, B> BoxOffice<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        store: S,
        bus: B,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
        config: &BoxOfficeConfig,
    ) -> Self {
        let dispatcher = Arc::new(CommandDispatcher::new(store, bus));
        let orders = OrderStateMachine::new(dispatcher.clone(), catalog.clone(), clock.clone());
        let settlement = SettlementCoordinator::new(
            dispatcher.clone(),
            orders.clone(),
            clock.clone(),
            config.settlement.clone(),
        );
        let inventory = InventoryQueryService::new(orders.ledger().clone(), catalog, clock);

        Self {
            dispatcher,
            orders,
            settlement,
            inventory,
            max_attempts: config.max_commit_retries.max(1),
        }
    }

    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    pub fn bus(&self) -> &B {
        self.dispatcher.bus()
    }

    pub fn inventory(&self) -> &InventoryQueryService<S, B> {
        &self.inventory
    }

    fn with_retries<T>(
        &self,
        operation: &'static str,
        mut f: impl FnMut() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    debug!(operation, attempt, error = %err, "commit conflict, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Admit a purchase; returns the pending order or the denial.
    #[instrument(skip(self))]
    pub fn open_order(
        &self,
        user_id: UserId,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
    ) -> EngineResult<OrderSnapshot> {
        // One id for every attempt, so a retry after an ambiguous failure replays
        // instead of reserving twice.
        let order_id = OrderId::new(AggregateId::new());
        self.open_order_with_id(order_id, user_id, event_id, ticket_type_id)
    }

    /// Idempotent variant of `open_order` for callers that retry on their side.
    #[instrument(skip(self))]
    pub fn open_order_with_id(
        &self,
        order_id: OrderId,
        user_id: UserId,
        event_id: EventId,
        ticket_type_id: TicketTypeId,
    ) -> EngineResult<OrderSnapshot> {
        let result = self.with_retries("open_order", || {
            self.orders
                .open_with_id(order_id, user_id, event_id, ticket_type_id)
        });
        if let Err(err) = &result {
            if let Some(reason) = err.denial() {
                info!(order_id = %order_id, reason = reason.code(), "order denied");
            }
        }
        result
    }

    #[instrument(skip(self))]
    pub fn cancel_order(&self, order_id: OrderId) -> EngineResult<OrderSnapshot> {
        self.with_retries("cancel_order", || self.orders.cancel(order_id))
    }

    pub fn order(&self, order_id: OrderId) -> EngineResult<Option<OrderSnapshot>> {
        self.orders.get(order_id)
    }

    #[instrument(skip(self))]
    pub fn record_payment(
        &self,
        order_id: OrderId,
        method: PaymentMethod,
        amount_hint: Option<Decimal>,
        transaction_ref: Option<String>,
    ) -> EngineResult<PaymentSnapshot> {
        self.with_retries("record_payment", || {
            self.settlement
                .record_payment(order_id, method, amount_hint, transaction_ref.clone())
        })
    }

    pub fn payment(&self, payment_id: PaymentId) -> EngineResult<Option<PaymentSnapshot>> {
        self.settlement.get(payment_id)
    }

    #[instrument(skip(self))]
    pub fn settle_payment(
        &self,
        payment_id: PaymentId,
        outcome: SettlementOutcome,
    ) -> EngineResult<OrderSnapshot> {
        self.with_retries("settle_payment", || {
            self.settlement.settle(payment_id, outcome.clone())
        })
    }

    #[instrument(skip(self))]
    pub fn refund_payment(&self, payment_id: PaymentId) -> EngineResult<OrderSnapshot> {
        self.with_retries("refund_payment", || self.settlement.refund(payment_id))
    }

    pub fn available_units(&self, ticket_type_id: TicketTypeId) -> EngineResult<u32> {
        self.inventory.available_units(ticket_type_id)
    }

    pub fn is_on_sale(&self, ticket_type_id: TicketTypeId) -> EngineResult<bool> {
        self.inventory.is_on_sale(ticket_type_id)
    }

    pub fn list_for_event(&self, event_id: EventId) -> EngineResult<Vec<Availability>> {
        self.inventory.list_for_event(event_id)
    }

    #[instrument(skip(self))]
    pub fn recover_stale_attempts(&self) -> EngineResult<RecoveryReport> {
        self.settlement.recover_stale_attempts()
    }
}
