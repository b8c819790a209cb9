//! Lifecycle notices handed to the notification collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use turnstile_core::UserId;
use turnstile_events::Event;

use crate::order::{CancelReason, OrderEvent, OrderId};
use crate::ticket_type::{EventId, TicketTypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    OrderOpened,
    OrderConfirmed,
    OrderCanceled,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::OrderOpened => "order_opened",
            NoticeKind::OrderConfirmed => "order_confirmed",
            NoticeKind::OrderCanceled => "order_canceled",
        }
    }
}

/// One order lifecycle transition, flattened for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNotice {
    pub kind: NoticeKind,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub ticket_type_id: TicketTypeId,
    pub cancel_reason: Option<CancelReason>,
    pub occurred_at: DateTime<Utc>,
}

impl From<&OrderEvent> for OrderNotice {
    fn from(event: &OrderEvent) -> Self {
        let occurred_at = event.occurred_at();
        match event {
            OrderEvent::OrderOpened(e) => Self {
                kind: NoticeKind::OrderOpened,
                order_id: e.order_id,
                user_id: e.user_id,
                event_id: e.event_id,
                ticket_type_id: e.ticket_type_id,
                cancel_reason: None,
                occurred_at,
            },
            OrderEvent::OrderConfirmed(e) => Self {
                kind: NoticeKind::OrderConfirmed,
                order_id: e.order_id,
                user_id: e.user_id,
                event_id: e.event_id,
                ticket_type_id: e.ticket_type_id,
                cancel_reason: None,
                occurred_at,
            },
            OrderEvent::OrderCanceled(e) => Self {
                kind: NoticeKind::OrderCanceled,
                order_id: e.order_id,
                user_id: e.user_id,
                event_id: e.event_id,
                ticket_type_id: e.ticket_type_id,
                cancel_reason: Some(e.reason),
                occurred_at,
            },
        }
    }
}
