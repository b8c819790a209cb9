//! Read-only inventory queries.
//!
//! Answers are advisory: they replay the pool stream at read time without
//! taking part in any unit of work. A caller that sees one unit left can still
//! lose the race in `open` and receive `sold_out`.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use turnstile_events::{EventBus, EventEnvelope};
use turnstile_ticketing::{EventId, TicketType, TicketTypeId};

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::ledger::ReservationLedger;

/// Availability of one ticket type at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub ticket_type_id: TicketTypeId,
    pub name: String,
    pub unit_price: Decimal,
    pub capacity: u32,
    pub sold: u32,
    pub available: u32,
    pub on_sale: bool,
}

pub struct InventoryQueryService<S, B> {
    ledger: ReservationLedger<S, B>,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
}

impl<S, B> InventoryQueryService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        ledger: ReservationLedger<S, B>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            clock,
        }
    }

    fn ticket_type(&self, id: TicketTypeId) -> EngineResult<TicketType> {
        self.catalog
            .ticket_type(id)?
            .ok_or_else(EngineError::not_found)
    }

    /// Capacity minus committed units, never below zero.
    pub fn available_units(&self, ticket_type_id: TicketTypeId) -> EngineResult<u32> {
        Ok(self.availability(ticket_type_id)?.available)
    }

    /// `capacity - available_units`.
    pub fn sold_units(&self, ticket_type_id: TicketTypeId) -> EngineResult<u32> {
        Ok(self.availability(ticket_type_id)?.sold)
    }

    pub fn is_on_sale(&self, ticket_type_id: TicketTypeId) -> EngineResult<bool> {
        Ok(self.ticket_type(ticket_type_id)?.is_on_sale(self.clock.now()))
    }

    pub fn availability(&self, ticket_type_id: TicketTypeId) -> EngineResult<Availability> {
        let ticket_type = self.ticket_type(ticket_type_id)?;
        self.describe(&ticket_type)
    }

    /// Every ticket type of an event, cheapest first.
    pub fn list_for_event(&self, event_id: EventId) -> EngineResult<Vec<Availability>> {
        let mut ticket_types = self.catalog.ticket_types_for_event(event_id)?;
        ticket_types.sort_by(|a, b| {
            a.unit_price()
                .cmp(&b.unit_price())
                .then_with(|| a.name().cmp(b.name()))
        });
        ticket_types.iter().map(|tt| self.describe(tt)).collect()
    }

    fn describe(&self, ticket_type: &TicketType) -> EngineResult<Availability> {
        let pool = self.ledger.load_pool(ticket_type.id())?;
        let available = pool.aggregate.available_units(ticket_type.capacity());
        Ok(Availability {
            ticket_type_id: ticket_type.id(),
            name: ticket_type.name().to_string(),
            unit_price: ticket_type.unit_price(),
            capacity: ticket_type.capacity(),
            sold: ticket_type.capacity() - available,
            available,
            on_sale: ticket_type.is_on_sale(self.clock.now()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use turnstile_core::{AggregateId, UserId};
    use turnstile_events::InMemoryEventBus;
    use turnstile_ticketing::{EventListing, SaleWindow};

    use crate::catalog::InMemoryCatalog;
    use crate::clock::FixedClock;
    use crate::command_dispatcher::CommandDispatcher;
    use crate::event_store::InMemoryEventStore;
    use crate::orders::OrderStateMachine;

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn setup() -> (
        InventoryQueryService<Store, Bus>,
        OrderStateMachine<Store, Bus>,
        Arc<InMemoryCatalog>,
        Arc<FixedClock>,
        EventId,
    ) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let catalog = Arc::new(InMemoryCatalog::new());
        let event_id = EventId::new(AggregateId::new());
        catalog.upsert_event(EventListing::published(event_id)).unwrap();

        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
        ));
        let orders = OrderStateMachine::new(dispatcher, catalog.clone(), clock.clone());
        let inventory =
            InventoryQueryService::new(orders.ledger().clone(), catalog.clone(), clock.clone());
        (inventory, orders, catalog, clock, event_id)
    }

    fn add_type(catalog: &InMemoryCatalog, event_id: EventId, name: &str, price: i64, capacity: u32) -> TicketTypeId {
        let id = TicketTypeId::new(AggregateId::new());
        catalog
            .upsert_ticket_type(
                TicketType::new(id, event_id, name, Decimal::new(price, 0), capacity).unwrap(),
            )
            .unwrap();
        id
    }

    #[test]
    fn sold_and_available_track_open_orders() {
        let (inventory, orders, catalog, _clock, event_id) = setup();
        let tt = add_type(&catalog, event_id, "Balcony", 30, 3);
        assert_eq!(inventory.available_units(tt).unwrap(), 3);

        orders.open(UserId::new(), event_id, tt).unwrap();
        assert_eq!(inventory.available_units(tt).unwrap(), 2);
        assert_eq!(inventory.sold_units(tt).unwrap(), 1);
    }

    #[test]
    fn shrinking_capacity_below_sold_clamps_to_zero() {
        let (inventory, orders, catalog, _clock, event_id) = setup();
        let tt = add_type(&catalog, event_id, "Floor", 50, 2);
        orders.open(UserId::new(), event_id, tt).unwrap();
        orders.open(UserId::new(), event_id, tt).unwrap();

        catalog.set_capacity(tt, 1).unwrap();
        let availability = inventory.availability(tt).unwrap();
        assert_eq!(availability.available, 0);
        assert_eq!(availability.sold, 1);
    }

    #[test]
    fn on_sale_follows_the_injected_clock() {
        let (inventory, _orders, catalog, clock, event_id) = setup();
        let tt = add_type(&catalog, event_id, "Early bird", 20, 10);
        let start = clock.now() + Duration::hours(1);
        catalog
            .set_sale_window(tt, SaleWindow::new(Some(start), None).unwrap())
            .unwrap();

        assert!(!inventory.is_on_sale(tt).unwrap());
        clock.set(start);
        assert!(inventory.is_on_sale(tt).unwrap());
    }

    #[test]
    fn listing_is_sorted_by_price() {
        let (inventory, _orders, catalog, _clock, event_id) = setup();
        add_type(&catalog, event_id, "VIP", 120, 5);
        add_type(&catalog, event_id, "Standard", 45, 100);
        add_type(&catalog, event_id, "Student", 25, 20);

        let names: Vec<String> = inventory
            .list_for_event(event_id)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["Student", "Standard", "VIP"]);
    }

    #[test]
    fn unknown_ticket_type_is_not_found() {
        let (inventory, _orders, _catalog, _clock, _event_id) = setup();
        let err = inventory
            .available_units(TicketTypeId::new(AggregateId::new()))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
