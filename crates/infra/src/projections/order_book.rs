//! Order book read model: orders per user and per event, payments per order.
//!
//! Fed from committed order and payment records. Each stream is applied
//! strictly in sequence; redelivered records at or below the stream's cursor
//! are ignored, so at-least-once delivery is safe.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use turnstile_core::{AggregateId, UserId};
use turnstile_events::EventEnvelope;
use turnstile_ticketing::{
    CancelReason, EventId, OrderEvent, OrderId, OrderStatus, PaymentEvent, PaymentId,
    PaymentMethod, PaymentStatus, TicketTypeId, ORDER_AGGREGATE_TYPE, PAYMENT_AGGREGATE_TYPE,
};

use crate::event_store::{EventStore, EventStoreError};
use crate::read_model::{InMemoryReadStore, ReadStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookEntry {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub total_price: Decimal,
    pub status: OrderStatus,
    pub confirmed_by: Option<PaymentId>,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEntry {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_ref: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum OrderBookError {
    #[error("failed to deserialize {aggregate_type} record: {reason}")]
    Deserialize {
        aggregate_type: String,
        reason: String,
    },

    #[error("out-of-order record for {aggregate_id} (last={last}, found={found})")]
    NonMonotonicSequence {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },

    #[error("record payload does not belong to stream {0}")]
    StreamMismatch(AggregateId),

    #[error("no entry opened for stream {0}")]
    MissingEntry(AggregateId),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub struct OrderBookProjection<
    O = InMemoryReadStore<OrderId, OrderBookEntry>,
    P = InMemoryReadStore<PaymentId, PaymentEntry>,
> {
    orders: O,
    payments: P,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl OrderBookProjection {
    pub fn in_memory() -> Self {
        Self::new(InMemoryReadStore::new(), InMemoryReadStore::new())
    }
}

impl<O, P> OrderBookProjection<O, P>
where
    O: ReadStore<OrderId, OrderBookEntry>,
    P: ReadStore<PaymentId, PaymentEntry>,
{
    pub fn new(orders: O, payments: P) -> Self {
        Self {
            orders,
            payments,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn order(&self, order_id: OrderId) -> Option<OrderBookEntry> {
        self.orders.get(&order_id)
    }

    /// A user's orders, newest first.
    pub fn orders_for_user(&self, user_id: UserId) -> Vec<OrderBookEntry> {
        newest_orders_first(self.orders.list().into_iter().filter(|o| o.user_id == user_id))
    }

    /// Orders placed for an event, newest first.
    pub fn orders_for_event(&self, event_id: EventId) -> Vec<OrderBookEntry> {
        newest_orders_first(self.orders.list().into_iter().filter(|o| o.event_id == event_id))
    }

    /// Payment attempts made against an order, newest first.
    pub fn payments_for_order(&self, order_id: OrderId) -> Vec<PaymentEntry> {
        let mut payments: Vec<_> = self
            .payments
            .list()
            .into_iter()
            .filter(|p| p.order_id == order_id)
            .collect();
        payments.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        payments
    }

    fn cursor(&self, aggregate_id: AggregateId) -> u64 {
        match self.cursors.read() {
            Ok(cursors) => cursors.get(&aggregate_id).copied().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn advance(&self, aggregate_id: AggregateId, seq: u64) {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.insert(aggregate_id, seq);
        }
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), OrderBookError> {
        let aggregate_type = envelope.aggregate_type();
        if aggregate_type != ORDER_AGGREGATE_TYPE && aggregate_type != PAYMENT_AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();
        let last = self.cursor(aggregate_id);
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(OrderBookError::NonMonotonicSequence {
                aggregate_id,
                last,
                found: seq,
            });
        }

        let deserialize = |e: serde_json::Error| OrderBookError::Deserialize {
            aggregate_type: aggregate_type.to_string(),
            reason: e.to_string(),
        };
        if aggregate_type == ORDER_AGGREGATE_TYPE {
            let event: OrderEvent =
                serde_json::from_value(envelope.payload().clone()).map_err(deserialize)?;
            if event.order_id().0 != aggregate_id {
                return Err(OrderBookError::StreamMismatch(aggregate_id));
            }
            self.apply_order(&event)?;
        } else {
            let event: PaymentEvent =
                serde_json::from_value(envelope.payload().clone()).map_err(deserialize)?;
            self.apply_payment(aggregate_id, &event)?;
        }

        self.advance(aggregate_id, seq);
        Ok(())
    }

    fn apply_order(&self, event: &OrderEvent) -> Result<(), OrderBookError> {
        if let OrderEvent::OrderOpened(e) = event {
            self.orders.upsert(
                e.order_id,
                OrderBookEntry {
                    order_id: e.order_id,
                    user_id: e.user_id,
                    event_id: e.event_id,
                    ticket_type_id: e.ticket_type_id,
                    total_price: e.total_price,
                    status: OrderStatus::Pending,
                    confirmed_by: None,
                    cancel_reason: None,
                    created_at: e.occurred_at,
                    updated_at: e.occurred_at,
                },
            );
            return Ok(());
        }

        let order_id = event.order_id();
        let mut entry = self
            .orders
            .get(&order_id)
            .ok_or(OrderBookError::MissingEntry(order_id.0))?;
        match event {
            OrderEvent::OrderOpened(_) => {}
            OrderEvent::OrderConfirmed(e) => {
                entry.status = OrderStatus::Confirmed;
                entry.confirmed_by = Some(e.payment_id);
                entry.updated_at = e.occurred_at;
            }
            OrderEvent::OrderCanceled(e) => {
                entry.status = OrderStatus::Canceled;
                entry.cancel_reason = Some(e.reason);
                entry.updated_at = e.occurred_at;
            }
        }
        self.orders.upsert(order_id, entry);
        Ok(())
    }

    fn apply_payment(
        &self,
        aggregate_id: AggregateId,
        event: &PaymentEvent,
    ) -> Result<(), OrderBookError> {
        let payment_id = PaymentId::new(aggregate_id);
        if let PaymentEvent::PaymentRecorded(e) = event {
            if e.payment_id != payment_id {
                return Err(OrderBookError::StreamMismatch(aggregate_id));
            }
            self.payments.upsert(
                payment_id,
                PaymentEntry {
                    payment_id,
                    order_id: e.order_id,
                    amount: e.amount,
                    method: e.method,
                    status: PaymentStatus::Pending,
                    transaction_ref: e.transaction_ref.clone(),
                    recorded_at: e.occurred_at,
                    settled_at: None,
                },
            );
            return Ok(());
        }

        let mut entry = self
            .payments
            .get(&payment_id)
            .ok_or(OrderBookError::MissingEntry(aggregate_id))?;
        match event {
            PaymentEvent::PaymentRecorded(_) => {}
            PaymentEvent::PaymentCompleted(e) => {
                entry.status = PaymentStatus::Completed;
                if e.transaction_ref.is_some() {
                    entry.transaction_ref = e.transaction_ref.clone();
                }
                entry.settled_at = Some(e.occurred_at);
            }
            PaymentEvent::PaymentFailed(e) => {
                entry.status = PaymentStatus::Failed;
                entry.settled_at = Some(e.occurred_at);
            }
            PaymentEvent::PaymentRefunded(_) => entry.status = PaymentStatus::Refunded,
        }
        self.payments.upsert(payment_id, entry);
        Ok(())
    }

    /// Drop everything and replay the given records in stream order.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), OrderBookError> {
        self.orders.clear();
        self.payments.clear();
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));
        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }

    /// Rebuild from every order and payment record in the store.
    pub fn rebuild_from_store<S: EventStore>(&self, store: &S) -> Result<(), OrderBookError> {
        let mut records = store.load_by_type(ORDER_AGGREGATE_TYPE)?;
        records.extend(store.load_by_type(PAYMENT_AGGREGATE_TYPE)?);
        self.rebuild_from_scratch(records.iter().map(|r| r.to_envelope()))
    }
}

fn newest_orders_first(orders: impl Iterator<Item = OrderBookEntry>) -> Vec<OrderBookEntry> {
    let mut orders: Vec<_> = orders.collect();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    orders
}
