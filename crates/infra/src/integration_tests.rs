//! Integration tests for the full box office pipeline.
//!
//! Tests: BoxOffice → UnitOfWork → EventStore → EventBus → OrderBook / notices
//!
//! Verifies:
//! - Capacity is never exceeded, under threads as well as sequentially
//! - Cancel, settle and refund move the derived count exactly as expected
//! - Read models and notifications follow committed state

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration as StdDuration, Instant};

    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::Value as JsonValue;

    use turnstile_core::{AggregateId, UserId};
    use turnstile_events::{EventEnvelope, InMemoryEventBus};
    use turnstile_ticketing::{
        CancelReason, DenialReason, EventId, EventListing, NoticeKind, OrderId, OrderNotice,
        OrderStatus, PaymentMethod, PaymentStatus, SaleWindow, TicketType, TicketTypeId,
    };

    use crate::box_office::BoxOffice;
    use crate::catalog::InMemoryCatalog;
    use crate::clock::{Clock, FixedClock};
    use crate::config::BoxOfficeConfig;
    use crate::event_store::InMemoryEventStore;
    use crate::notifications::{NotificationRelay, Notifier, NotifyError};
    use crate::projections::OrderBookProjection;
    use crate::settlement::SettlementOutcome;
    use crate::workers::ProjectionWorker;

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    struct Venue {
        office: Arc<BoxOffice<Store, Bus>>,
        catalog: Arc<InMemoryCatalog>,
        clock: Arc<FixedClock>,
        bus: Bus,
        event_id: EventId,
    }

    impl Venue {
        fn new() -> Self {
            Self::with_config(BoxOfficeConfig::default())
        }

        fn with_config(config: BoxOfficeConfig) -> Self {
            let catalog = Arc::new(InMemoryCatalog::new());
            let clock = Arc::new(FixedClock::new(
                Utc.with_ymd_and_hms(2025, 9, 12, 10, 0, 0).unwrap(),
            ));
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let event_id = EventId::new(AggregateId::new());
            catalog.upsert_event(EventListing::published(event_id)).unwrap();

            let office = BoxOffice::new(
                Arc::new(InMemoryEventStore::new()),
                bus.clone(),
                catalog.clone(),
                clock.clone(),
                &config,
            );
            Self {
                office: Arc::new(office),
                catalog,
                clock,
                bus,
                event_id,
            }
        }

        fn ticket_type(&self, capacity: u32) -> TicketTypeId {
            let id = TicketTypeId::new(AggregateId::new());
            self.catalog
                .upsert_ticket_type(
                    TicketType::new(id, self.event_id, "Standing", Decimal::new(65, 0), capacity)
                        .unwrap(),
                )
                .unwrap();
            id
        }

        fn open(&self, tt: TicketTypeId) -> Result<OrderId, crate::error::EngineError> {
            self.office
                .open_order(UserId::new(), self.event_id, tt)
                .map(|o| o.id)
        }

        fn pay(&self, order_id: OrderId) -> turnstile_ticketing::PaymentId {
            let payment = self
                .office
                .record_payment(order_id, PaymentMethod::CreditCard, None, None)
                .unwrap();
            self.office
                .settle_payment(
                    payment.id,
                    SettlementOutcome::Completed {
                        transaction_ref: Some(format!("txn-{order_id}")),
                    },
                )
                .unwrap();
            payment.id
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + StdDuration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(StdDuration::from_millis(10));
        }
    }

    #[test]
    fn concurrent_opens_never_oversell() {
        const CAPACITY: u32 = 5;
        const BUYERS: usize = 24;

        // Every lost race means another buyer committed, so CAPACITY + 1 attempts
        // always suffice to reach a definite grant or denial.
        let venue = Venue::with_config(BoxOfficeConfig {
            max_commit_retries: CAPACITY + 2,
            ..BoxOfficeConfig::default()
        });
        let tt = venue.ticket_type(CAPACITY);
        let barrier = Arc::new(Barrier::new(BUYERS));

        let handles: Vec<_> = (0..BUYERS)
            .map(|_| {
                let office = venue.office.clone();
                let barrier = barrier.clone();
                let event_id = venue.event_id;
                thread::spawn(move || {
                    barrier.wait();
                    office.open_order(UserId::new(), event_id, tt)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let sold_out = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.denial() == Some(DenialReason::SoldOut)))
            .count();

        assert_eq!(granted, CAPACITY as usize);
        assert_eq!(sold_out, BUYERS - CAPACITY as usize);
        assert_eq!(venue.office.available_units(tt).unwrap(), 0);
    }

    #[test]
    fn cancel_releases_exactly_one_unit() {
        let venue = Venue::new();
        let tt = venue.ticket_type(3);
        let order_id = venue.open(tt).unwrap();
        venue.open(tt).unwrap();
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);

        let canceled = venue.office.cancel_order(order_id).unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert_eq!(canceled.cancel_reason, Some(CancelReason::Requested));
        assert_eq!(venue.office.available_units(tt).unwrap(), 2);

        let err = venue.office.cancel_order(order_id).unwrap_err();
        assert_eq!(err.code(), "already_canceled");
        assert_eq!(venue.office.available_units(tt).unwrap(), 2);
    }

    #[test]
    fn cancel_of_unknown_order_is_not_found() {
        let venue = Venue::new();
        let err = venue
            .office
            .cancel_order(OrderId::new(AggregateId::new()))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn settle_then_refund_releases_the_unit_once() {
        let venue = Venue::new();
        let tt = venue.ticket_type(2);
        let order_id = venue.open(tt).unwrap();
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);

        let payment_id = venue.pay(order_id);
        let order = venue.office.order(order_id).unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);

        let refunded = venue.office.refund_payment(payment_id).unwrap();
        assert_eq!(refunded.status, OrderStatus::Canceled);
        assert_eq!(venue.office.available_units(tt).unwrap(), 2);
        assert_eq!(
            venue.office.payment(payment_id).unwrap().unwrap().status,
            PaymentStatus::Refunded
        );

        // Canceling the refunded order afterwards changes nothing.
        let err = venue.office.cancel_order(order_id).unwrap_err();
        assert_eq!(err.code(), "already_canceled");
        assert_eq!(venue.office.available_units(tt).unwrap(), 2);
    }

    #[test]
    fn capacity_round_trip() {
        let venue = Venue::new();
        let tt = venue.ticket_type(5);

        let orders: Vec<_> = (0..5).map(|_| venue.open(tt).unwrap()).collect();
        let err = venue.open(tt).unwrap_err();
        assert_eq!(err.denial(), Some(DenialReason::SoldOut));

        venue.office.cancel_order(orders[2]).unwrap();
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);

        venue.open(tt).unwrap();
        assert_eq!(venue.office.available_units(tt).unwrap(), 0);
    }

    #[test]
    fn future_sale_window_denies_with_capacity_left() {
        let venue = Venue::new();
        let tt = venue.ticket_type(10);
        let opens_at = venue.clock.now() + Duration::days(1);
        venue
            .catalog
            .set_sale_window(tt, SaleWindow::new(Some(opens_at), None).unwrap())
            .unwrap();

        assert!(!venue.office.is_on_sale(tt).unwrap());
        let err = venue.open(tt).unwrap_err();
        assert_eq!(err.denial(), Some(DenialReason::NotOnSale));
        assert_eq!(venue.office.available_units(tt).unwrap(), 10);

        venue.clock.set(opens_at);
        assert!(venue.office.is_on_sale(tt).unwrap());
        venue.open(tt).unwrap();
    }

    #[test]
    fn sale_window_end_is_exclusive() {
        let venue = Venue::new();
        let tt = venue.ticket_type(10);
        let closes_at = venue.clock.now() + Duration::hours(2);
        venue
            .catalog
            .set_sale_window(tt, SaleWindow::new(None, Some(closes_at)).unwrap())
            .unwrap();

        venue.clock.set(closes_at - Duration::seconds(1));
        venue.open(tt).unwrap();
        venue.clock.set(closes_at);
        assert_eq!(
            venue.open(tt).unwrap_err().denial(),
            Some(DenialReason::NotOnSale)
        );
    }

    #[test]
    fn payment_failure_keeps_the_unit_until_cancel() {
        let venue = Venue::new();
        let tt = venue.ticket_type(1);
        let order_id = venue.open(tt).unwrap();
        let payment = venue
            .office
            .record_payment(order_id, PaymentMethod::CreditCard, None, None)
            .unwrap();

        let order = venue
            .office
            .settle_payment(
                payment.id,
                SettlementOutcome::Failed {
                    reason: "insufficient funds".into(),
                },
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(venue.office.available_units(tt).unwrap(), 0);

        // A retry with a new attempt can still confirm the same order.
        let confirmed_by = venue.pay(order_id);
        let order = venue.office.order(order_id).unwrap().unwrap();
        assert_eq!(order.confirmed_by, Some(confirmed_by));

        venue.office.cancel_order(order_id).unwrap();
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);
    }

    #[test]
    fn unpublished_or_canceled_events_deny_event_unavailable() {
        let venue = Venue::new();
        let tt = venue.ticket_type(4);

        venue
            .catalog
            .upsert_event(EventListing::new(venue.event_id, false, false))
            .unwrap();
        assert_eq!(
            venue.open(tt).unwrap_err().denial(),
            Some(DenialReason::EventUnavailable)
        );

        venue
            .catalog
            .upsert_event(EventListing::new(venue.event_id, true, true))
            .unwrap();
        assert_eq!(
            venue.open(tt).unwrap_err().denial(),
            Some(DenialReason::EventUnavailable)
        );
        assert_eq!(venue.office.available_units(tt).unwrap(), 4);
    }

    #[test]
    fn ticket_type_of_another_event_is_invalid() {
        let venue = Venue::new();
        let other_event = EventId::new(AggregateId::new());
        venue
            .catalog
            .upsert_event(EventListing::published(other_event))
            .unwrap();
        let tt = venue.ticket_type(4);

        let err = venue
            .office
            .open_order(UserId::new(), other_event, tt)
            .unwrap_err();
        assert_eq!(err.denial(), Some(DenialReason::InvalidTicketType));
    }

    #[test]
    fn replayed_open_reserves_once() {
        let venue = Venue::new();
        let tt = venue.ticket_type(3);
        let user = UserId::new();
        let order_id = OrderId::new(AggregateId::new());

        let first = venue
            .office
            .open_order_with_id(order_id, user, venue.event_id, tt)
            .unwrap();
        let again = venue
            .office
            .open_order_with_id(order_id, user, venue.event_id, tt)
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(venue.office.available_units(tt).unwrap(), 2);

        let err = venue
            .office
            .open_order_with_id(order_id, UserId::new(), venue.event_id, tt)
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn replay_returns_the_order_after_the_event_is_canceled() {
        let venue = Venue::new();
        let tt = venue.ticket_type(2);
        let user = UserId::new();
        let order_id = OrderId::new(AggregateId::new());
        let first = venue
            .office
            .open_order_with_id(order_id, user, venue.event_id, tt)
            .unwrap();

        venue
            .catalog
            .upsert_event(EventListing::new(venue.event_id, true, true))
            .unwrap();
        let again = venue
            .office
            .open_order_with_id(order_id, user, venue.event_id, tt)
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);

        assert_eq!(
            venue.open(tt).unwrap_err().denial(),
            Some(DenialReason::EventUnavailable)
        );
    }

    #[test]
    fn raised_capacity_is_used_by_the_next_reservation() {
        let venue = Venue::new();
        let tt = venue.ticket_type(1);
        venue.open(tt).unwrap();
        assert_eq!(
            venue.open(tt).unwrap_err().denial(),
            Some(DenialReason::SoldOut)
        );

        venue.catalog.set_capacity(tt, 2).unwrap();
        venue.open(tt).unwrap();
        assert_eq!(venue.office.available_units(tt).unwrap(), 0);
    }

    #[test]
    fn stale_payment_recovery_releases_when_configured() {
        let mut config = BoxOfficeConfig::default();
        config.settlement.release_on_timeout = true;
        let venue = Venue::with_config(config);
        let tt = venue.ticket_type(1);
        let order_id = venue.open(tt).unwrap();
        venue
            .office
            .record_payment(order_id, PaymentMethod::BankTransfer, None, None)
            .unwrap();

        venue.clock.advance(Duration::minutes(16));
        let report = venue.office.recover_stale_attempts().unwrap();
        assert_eq!(report.canceled, vec![order_id]);
        assert_eq!(venue.office.available_units(tt).unwrap(), 1);
    }

    #[test]
    fn stale_recovery_spares_an_order_with_a_fresh_attempt() {
        let mut config = BoxOfficeConfig::default();
        config.settlement.payment_timeout_secs = 600;
        config.settlement.release_on_timeout = true;
        let venue = Venue::with_config(config);
        let tt = venue.ticket_type(1);
        let order_id = venue.open(tt).unwrap();
        let abandoned = venue
            .office
            .record_payment(order_id, PaymentMethod::CreditCard, None, None)
            .unwrap();
        venue.clock.advance(Duration::seconds(590));
        let retry = venue
            .office
            .record_payment(order_id, PaymentMethod::CreditCard, None, None)
            .unwrap();

        venue.clock.advance(Duration::seconds(20));
        let report = venue.office.recover_stale_attempts().unwrap();
        assert_eq!(report.failed, vec![abandoned.id]);
        assert!(report.canceled.is_empty());
        assert_eq!(venue.office.available_units(tt).unwrap(), 0);

        let confirmed = venue
            .office
            .settle_payment(
                retry.id,
                SettlementOutcome::Completed {
                    transaction_ref: None,
                },
            )
            .unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(
            venue.office.payment(retry.id).unwrap().unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[test]
    fn order_book_follows_committed_records() {
        let venue = Venue::new();
        let tt = venue.ticket_type(3);
        let projection = Arc::new(OrderBookProjection::in_memory());
        let live = projection.clone();
        let worker = ProjectionWorker::spawn("order-book", &venue.bus, move |env: EventEnvelope<JsonValue>| {
            live.apply_envelope(&env)
        })
        .unwrap();

        let user = UserId::new();
        let kept = venue
            .office
            .open_order(user, venue.event_id, tt)
            .unwrap()
            .id;
        let dropped = venue
            .office
            .open_order(user, venue.event_id, tt)
            .unwrap()
            .id;
        let payment_id = venue.pay(kept);
        venue.office.cancel_order(dropped).unwrap();

        wait_until(|| {
            projection.payments_for_order(kept).first().map(|p| p.status)
                == Some(PaymentStatus::Completed)
                && projection.order(dropped).map(|o| o.status) == Some(OrderStatus::Canceled)
        });
        worker.shutdown();

        let mine = projection.orders_for_user(user);
        assert_eq!(mine.len(), 2);
        assert_eq!(projection.order(kept).unwrap().confirmed_by, Some(payment_id));
        assert_eq!(projection.orders_for_event(venue.event_id).len(), 2);

        // A rebuild from the store lands on the same state.
        let rebuilt = OrderBookProjection::in_memory();
        rebuilt.rebuild_from_store(venue.office.store()).unwrap();
        assert_eq!(rebuilt.order(kept), projection.order(kept));
        assert_eq!(rebuilt.order(dropped), projection.order(dropped));
        assert_eq!(rebuilt.payments_for_order(kept), projection.payments_for_order(kept));
    }

    #[derive(Default)]
    struct Inbox {
        notices: Mutex<Vec<OrderNotice>>,
    }

    impl Notifier for Inbox {
        fn deliver(&self, notice: &OrderNotice) -> Result<(), NotifyError> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    #[test]
    fn lifecycle_notices_are_emitted_after_commit() {
        let venue = Venue::new();
        let tt = venue.ticket_type(2);
        let inbox = Arc::new(Inbox::default());
        let relay = NotificationRelay::spawn(&venue.bus, inbox.clone()).unwrap();

        let order_id = venue.open(tt).unwrap();
        let payment_id = venue.pay(order_id);
        venue.office.refund_payment(payment_id).unwrap();
        // Denials commit nothing and notify nothing.
        venue.catalog.set_capacity(tt, 1).unwrap();
        venue.open(tt).unwrap();
        let _ = venue.open(tt);

        wait_until(|| inbox.notices.lock().unwrap().len() >= 4);
        relay.shutdown();

        let kinds: Vec<_> = inbox
            .notices
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NoticeKind::OrderOpened,
                NoticeKind::OrderConfirmed,
                NoticeKind::OrderCanceled,
                NoticeKind::OrderOpened,
            ]
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Open,
            Cancel(usize),
            Pay(usize),
            Refund(usize),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => Just(Op::Open),
                1 => (0usize..16).prop_map(Op::Cancel),
                1 => (0usize..16).prop_map(Op::Pay),
                1 => (0usize..16).prop_map(Op::Refund),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn available_units_match_active_orders(
                capacity in 1u32..6,
                ops in proptest::collection::vec(op_strategy(), 0..40),
            ) {
                let venue = Venue::new();
                let tt = venue.ticket_type(capacity);
                let mut orders: Vec<OrderId> = Vec::new();
                let mut payments = std::collections::HashMap::new();

                for op in ops {
                    match op {
                        Op::Open => {
                            if let Ok(id) = venue.open(tt) {
                                orders.push(id);
                            }
                        }
                        Op::Cancel(i) if !orders.is_empty() => {
                            let _ = venue.office.cancel_order(orders[i % orders.len()]);
                        }
                        Op::Pay(i) if !orders.is_empty() => {
                            let order_id = orders[i % orders.len()];
                            if let Ok(p) = venue.office.record_payment(order_id, PaymentMethod::Other, None, None) {
                                let completed = SettlementOutcome::Completed { transaction_ref: None };
                                if venue.office.settle_payment(p.id, completed).is_ok() {
                                    payments.insert(order_id, p.id);
                                }
                            }
                        }
                        Op::Refund(i) if !orders.is_empty() => {
                            let order_id = orders[i % orders.len()];
                            if let Some(p) = payments.get(&order_id) {
                                let _ = venue.office.refund_payment(*p);
                            }
                        }
                        _ => {}
                    }

                    let active = orders
                        .iter()
                        .filter(|id| {
                            venue.office.order(**id).unwrap().unwrap().status != OrderStatus::Canceled
                        })
                        .count() as u32;
                    prop_assert!(active <= capacity);
                    prop_assert_eq!(venue.office.available_units(tt).unwrap(), capacity - active);
                }
            }
        }
    }
}
