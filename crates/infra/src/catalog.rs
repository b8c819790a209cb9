//! Read-only access to organizer-owned catalog data.
//!
//! The catalog (events, ticket types) is maintained by external CRUD flows. The
//! engine only loads immutable snapshots from it at decision time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use turnstile_ticketing::{EventId, EventListing, SaleWindow, TicketType, TicketTypeId};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error("unknown ticket type {0}")]
    UnknownTicketType(TicketTypeId),
}

pub trait Catalog: Send + Sync {
    fn event(&self, id: EventId) -> Result<Option<EventListing>, CatalogError>;

    fn ticket_type(&self, id: TicketTypeId) -> Result<Option<TicketType>, CatalogError>;

    fn ticket_types_for_event(&self, id: EventId) -> Result<Vec<TicketType>, CatalogError>;
}

impl<C> Catalog for Arc<C>
where
    C: Catalog + ?Sized,
{
    fn event(&self, id: EventId) -> Result<Option<EventListing>, CatalogError> {
        (**self).event(id)
    }

    fn ticket_type(&self, id: TicketTypeId) -> Result<Option<TicketType>, CatalogError> {
        (**self).ticket_type(id)
    }

    fn ticket_types_for_event(&self, id: EventId) -> Result<Vec<TicketType>, CatalogError> {
        (**self).ticket_types_for_event(id)
    }
}

/// In-memory catalog for tests, the demo binary and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    events: RwLock<HashMap<EventId, EventListing>>,
    ticket_types: RwLock<HashMap<TicketTypeId, TicketType>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_event(&self, listing: EventListing) -> Result<(), CatalogError> {
        let mut events = self.events.write().map_err(|_| poisoned())?;
        events.insert(listing.id(), listing);
        Ok(())
    }

    pub fn upsert_ticket_type(&self, ticket_type: TicketType) -> Result<(), CatalogError> {
        let mut ticket_types = self.ticket_types.write().map_err(|_| poisoned())?;
        ticket_types.insert(ticket_type.id(), ticket_type);
        Ok(())
    }

    /// Organizer capacity edit; applies to the next reservation.
    pub fn set_capacity(&self, id: TicketTypeId, capacity: u32) -> Result<(), CatalogError> {
        self.edit(id, |tt| tt.set_capacity(capacity))
    }

    pub fn set_sale_window(&self, id: TicketTypeId, window: SaleWindow) -> Result<(), CatalogError> {
        self.edit(id, |tt| tt.set_sale_window(window))
    }

    fn edit(&self, id: TicketTypeId, f: impl FnOnce(&mut TicketType)) -> Result<(), CatalogError> {
        let mut ticket_types = self.ticket_types.write().map_err(|_| poisoned())?;
        let tt = ticket_types
            .get_mut(&id)
            .ok_or(CatalogError::UnknownTicketType(id))?;
        f(tt);
        Ok(())
    }
}

fn poisoned() -> CatalogError {
    CatalogError::Unavailable("lock poisoned".to_string())
}

impl Catalog for InMemoryCatalog {
    fn event(&self, id: EventId) -> Result<Option<EventListing>, CatalogError> {
        let events = self.events.read().map_err(|_| poisoned())?;
        Ok(events.get(&id).copied())
    }

    fn ticket_type(&self, id: TicketTypeId) -> Result<Option<TicketType>, CatalogError> {
        let ticket_types = self.ticket_types.read().map_err(|_| poisoned())?;
        Ok(ticket_types.get(&id).cloned())
    }

    fn ticket_types_for_event(&self, id: EventId) -> Result<Vec<TicketType>, CatalogError> {
        let ticket_types = self.ticket_types.read().map_err(|_| poisoned())?;
        Ok(ticket_types
            .values()
            .filter(|tt| tt.event_id() == id)
            .cloned()
            .collect())
    }
}
