use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use turnstile_core::{Aggregate, AggregateId, AggregateRoot, DomainError, UserId};
use turnstile_events::Event;

use crate::error::TicketingError;
use crate::payment::PaymentId;
use crate::ticket_type::{EventId, TicketTypeId};

pub const ORDER_AGGREGATE_TYPE: &str = "ticketing.order";

/// Order identifier (an attendee's claim on one ticket unit).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl OrderStatus {
    /// Active orders hold a unit of their ticket type.
    pub fn is_active(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Canceled => "canceled",
        }
    }
}

/// Why an order was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    /// The attendee (or an operator) asked for it.
    Requested,
    /// The payment that confirmed the order was refunded.
    PaymentRefunded { payment_id: PaymentId },
    /// A payment attempt stayed pending past the settlement timeout.
    PaymentTimedOut { payment_id: PaymentId },
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Requested => "requested",
            CancelReason::PaymentRefunded { .. } => "payment_refunded",
            CancelReason::PaymentTimedOut { .. } => "payment_timed_out",
        }
    }
}

/// Immutable terms fixed when the order is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderTerms {
    user_id: UserId,
    event_id: EventId,
    ticket_type_id: TicketTypeId,
    /// Price snapshot taken at admission time.
    total_price: Decimal,
    created_at: DateTime<Utc>,
}

/// Point-in-time view of an order returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub total_price: Decimal,
    pub status: OrderStatus,
    /// The completed payment attempt that confirmed the order, if any.
    pub confirmed_by: Option<PaymentId>,
    pub cancel_reason: Option<CancelReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    terms: Option<OrderTerms>,
    status: OrderStatus,
    confirmed_by: Option<PaymentId>,
    cancel_reason: Option<CancelReason>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
}

impl Order {
    /// Create an empty, not-yet-opened aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            terms: None,
            status: OrderStatus::Pending,
            confirmed_by: None,
            cancel_reason: None,
            updated_at: None,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.terms.is_some()
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.terms.map(|t| t.user_id)
    }

    pub fn event_id(&self) -> Option<EventId> {
        self.terms.map(|t| t.event_id)
    }

    pub fn ticket_type_id(&self) -> Option<TicketTypeId> {
        self.terms.map(|t| t.ticket_type_id)
    }

    pub fn total_price(&self) -> Option<Decimal> {
        self.terms.map(|t| t.total_price)
    }

    pub fn confirmed_by(&self) -> Option<PaymentId> {
        self.confirmed_by
    }

    pub fn snapshot(&self) -> Option<OrderSnapshot> {
        let terms = self.terms?;
        Some(OrderSnapshot {
            id: self.id,
            user_id: terms.user_id,
            event_id: terms.event_id,
            ticket_type_id: terms.ticket_type_id,
            total_price: terms.total_price,
            status: self.status,
            confirmed_by: self.confirmed_by,
            cancel_reason: self.cancel_reason,
            created_at: terms.created_at,
            updated_at: self.updated_at.unwrap_or(terms.created_at),
            version: self.version,
        })
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub total_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder (a payment attempt reached `completed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub reason: CancelReason,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundOrder (the confirming payment was refunded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOrder {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    OpenOrder(OpenOrder),
    ConfirmOrder(ConfirmOrder),
    CancelOrder(CancelOrder),
    RefundOrder(RefundOrder),
}

/// Event: OrderOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOpened {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub total_price: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub payment_id: PaymentId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCanceled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCanceled {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub reason: CancelReason,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderOpened(OrderOpened),
    OrderConfirmed(OrderConfirmed),
    OrderCanceled(OrderCanceled),
}

impl OrderEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::OrderOpened(e) => e.order_id,
            OrderEvent::OrderConfirmed(e) => e.order_id,
            OrderEvent::OrderCanceled(e) => e.order_id,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderOpened(_) => "ticketing.order.opened",
            OrderEvent::OrderConfirmed(_) => "ticketing.order.confirmed",
            OrderEvent::OrderCanceled(_) => "ticketing.order.canceled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderOpened(e) => e.occurred_at,
            OrderEvent::OrderConfirmed(e) => e.occurred_at,
            OrderEvent::OrderCanceled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = TicketingError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderOpened(e) => {
                self.id = e.order_id;
                self.terms = Some(OrderTerms {
                    user_id: e.user_id,
                    event_id: e.event_id,
                    ticket_type_id: e.ticket_type_id,
                    total_price: e.total_price,
                    created_at: e.occurred_at,
                });
                self.status = OrderStatus::Pending;
            }
            OrderEvent::OrderConfirmed(e) => {
                self.status = OrderStatus::Confirmed;
                self.confirmed_by = Some(e.payment_id);
            }
            OrderEvent::OrderCanceled(e) => {
                self.status = OrderStatus::Canceled;
                self.cancel_reason = Some(e.reason);
            }
        }

        self.updated_at = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::OpenOrder(cmd) => self.handle_open(cmd),
            OrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
            OrderCommand::RefundOrder(cmd) => self.handle_refund(cmd),
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn opened_terms(&self, order_id: OrderId) -> Result<OrderTerms, DomainError> {
        self.ensure_order_id(order_id)?;
        self.terms.ok_or_else(DomainError::not_found)
    }

    fn handle_open(&self, cmd: &OpenOrder) -> Result<Vec<OrderEvent>, TicketingError> {
        self.ensure_order_id(cmd.order_id)?;

        if let Some(terms) = self.terms {
            let same_request = terms.user_id == cmd.user_id
                && terms.event_id == cmd.event_id
                && terms.ticket_type_id == cmd.ticket_type_id;
            if same_request {
                return Ok(vec![]);
            }
            return Err(DomainError::conflict("order id already used for different terms").into());
        }

        if cmd.total_price.is_sign_negative() {
            return Err(DomainError::validation("total_price cannot be negative").into());
        }

        Ok(vec![OrderEvent::OrderOpened(OrderOpened {
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            event_id: cmd.event_id,
            ticket_type_id: cmd.ticket_type_id,
            total_price: cmd.total_price,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<OrderEvent>, TicketingError> {
        let terms = self.opened_terms(cmd.order_id)?;

        if self.status != OrderStatus::Pending {
            return Err(TicketingError::invalid_transition(format!(
                "cannot confirm a {} order",
                self.status.as_str()
            )));
        }

        Ok(vec![OrderEvent::OrderConfirmed(OrderConfirmed {
            order_id: cmd.order_id,
            user_id: terms.user_id,
            event_id: terms.event_id,
            ticket_type_id: terms.ticket_type_id,
            payment_id: cmd.payment_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, TicketingError> {
        let terms = self.opened_terms(cmd.order_id)?;

        if self.status == OrderStatus::Canceled {
            return Err(TicketingError::AlreadyCanceled);
        }

        Ok(vec![self.canceled(terms, cmd.reason, cmd.occurred_at)])
    }

    fn handle_refund(&self, cmd: &RefundOrder) -> Result<Vec<OrderEvent>, TicketingError> {
        let terms = self.opened_terms(cmd.order_id)?;

        if self.status != OrderStatus::Confirmed {
            return Err(TicketingError::not_refundable(format!(
                "order is {}, not confirmed",
                self.status.as_str()
            )));
        }
        if self.confirmed_by != Some(cmd.payment_id) {
            return Err(TicketingError::not_refundable(
                "payment attempt did not confirm this order",
            ));
        }

        Ok(vec![self.canceled(
            terms,
            CancelReason::PaymentRefunded {
                payment_id: cmd.payment_id,
            },
            cmd.occurred_at,
        )])
    }

    fn canceled(
        &self,
        terms: OrderTerms,
        reason: CancelReason,
        occurred_at: DateTime<Utc>,
    ) -> OrderEvent {
        OrderEvent::OrderCanceled(OrderCanceled {
            order_id: self.id,
            user_id: terms.user_id,
            event_id: terms.event_id,
            ticket_type_id: terms.ticket_type_id,
            reason,
            occurred_at,
        })
    }
}
