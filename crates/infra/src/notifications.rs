//! Order lifecycle notifications.
//!
//! The relay listens to committed order records on the bus and hands each
//! transition to a `Notifier`. Delivery runs on its own thread after the commit,
//! so a slow or failing notifier never blocks or undoes an order transition.

use std::io;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use turnstile_events::{EventBus, EventEnvelope};
use turnstile_ticketing::{OrderEvent, OrderNotice, ORDER_AGGREGATE_TYPE};

use crate::workers::{ProjectionWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Outbound channel for lifecycle notices (email, push, webhooks, ...).
pub trait Notifier: Send + Sync {
    fn deliver(&self, notice: &OrderNotice) -> Result<(), NotifyError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn deliver(&self, notice: &OrderNotice) -> Result<(), NotifyError> {
        (**self).deliver(notice)
    }
}

/// Writes every notice to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn deliver(&self, notice: &OrderNotice) -> Result<(), NotifyError> {
        info!(
            notice = notice.kind.as_str(),
            order_id = %notice.order_id,
            user_id = %notice.user_id,
            ticket_type_id = %notice.ticket_type_id,
            cancel_reason = notice.cancel_reason.map(|r| r.as_str()),
            "order notice"
        );
        Ok(())
    }
}

/// Decode a committed record into a notice; `None` for anything but order events.
pub fn notice_from_envelope(envelope: &EventEnvelope<JsonValue>) -> Option<OrderNotice> {
    if envelope.aggregate_type() != ORDER_AGGREGATE_TYPE {
        return None;
    }
    match serde_json::from_value::<OrderEvent>(envelope.payload().clone()) {
        Ok(event) => Some(OrderNotice::from(&event)),
        Err(err) => {
            warn!(
                record_id = %envelope.record_id(),
                error = %err,
                "undecodable order record skipped by notification relay"
            );
            None
        }
    }
}

pub struct NotificationRelay {
    worker: WorkerHandle,
}

impl NotificationRelay {
    /// Subscribe to `bus` and deliver every order notice to `notifier`.
    pub fn spawn<B, N>(bus: &B, notifier: N) -> io::Result<Self>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
        N: Notifier + 'static,
    {
        let worker = ProjectionWorker::spawn(
            "turnstile-notifications",
            bus,
            move |envelope: EventEnvelope<JsonValue>| -> Result<(), NotifyError> {
                let Some(notice) = notice_from_envelope(&envelope) else {
                    return Ok(());
                };
                if let Err(err) = notifier.deliver(&notice) {
                    warn!(
                        notice = notice.kind.as_str(),
                        order_id = %notice.order_id,
                        error = %err,
                        "notification delivery failed"
                    );
                }
                Ok(())
            },
        )?;
        Ok(Self { worker })
    }

    pub fn shutdown(self) {
        self.worker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use rust_decimal::Decimal;
    use turnstile_core::{AggregateId, UserId};
    use turnstile_events::{Event, InMemoryEventBus};
    use turnstile_ticketing::{EventId, NoticeKind, OrderId, OrderOpened, TicketTypeId};
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<OrderNotice>>,
        fail: bool,
    }

    impl Notifier for Recording {
        fn deliver(&self, notice: &OrderNotice) -> Result<(), NotifyError> {
            self.seen.lock().unwrap().push(notice.clone());
            if self.fail {
                return Err(NotifyError::Unavailable("smtp down".into()));
            }
            Ok(())
        }
    }

    fn opened_envelope(order_id: OrderId) -> EventEnvelope<JsonValue> {
        let event = OrderEvent::OrderOpened(OrderOpened {
            order_id,
            user_id: UserId::new(),
            event_id: EventId::new(AggregateId::new()),
            ticket_type_id: TicketTypeId::new(AggregateId::new()),
            total_price: Decimal::ONE_HUNDRED,
            occurred_at: Utc::now(),
        });
        EventEnvelope::new(
            Uuid::now_v7(),
            order_id.0,
            ORDER_AGGREGATE_TYPE.to_string(),
            1,
            event.event_type().to_string(),
            event.occurred_at(),
            serde_json::to_value(&event).unwrap(),
        )
    }

    fn wait_for(recording: &Recording, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while recording.seen.lock().unwrap().len() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn non_order_records_are_ignored() {
        let mut envelope = opened_envelope(OrderId::new(AggregateId::new()));
        envelope = EventEnvelope::new(
            envelope.record_id(),
            envelope.aggregate_id(),
            "ticketing.pool".to_string(),
            1,
            "ticketing.pool.unit_reserved".to_string(),
            envelope.occurred_at(),
            envelope.payload().clone(),
        );
        assert!(notice_from_envelope(&envelope).is_none());
    }

    #[test]
    fn relay_delivers_order_notices() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
        let recording = Arc::new(Recording::default());
        let relay = NotificationRelay::spawn(&bus, recording.clone()).unwrap();

        let order_id = OrderId::new(AggregateId::new());
        bus.publish(opened_envelope(order_id)).unwrap();
        wait_for(&recording, 1);
        relay.shutdown();

        let seen = recording.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, NoticeKind::OrderOpened);
        assert_eq!(seen[0].order_id, order_id);
    }

    #[test]
    fn delivery_failures_do_not_stop_the_relay() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
        let recording = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let relay = NotificationRelay::spawn(&bus, recording.clone()).unwrap();

        bus.publish(opened_envelope(OrderId::new(AggregateId::new()))).unwrap();
        bus.publish(opened_envelope(OrderId::new(AggregateId::new()))).unwrap();
        wait_for(&recording, 2);
        relay.shutdown();

        assert_eq!(recording.seen.lock().unwrap().len(), 2);
    }
}
