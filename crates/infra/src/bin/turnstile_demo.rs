//! End-to-end walk-through of the box office against the configured store.

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use turnstile_core::{AggregateId, UserId};
use turnstile_events::{EventEnvelope, InMemoryEventBus};
use turnstile_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use turnstile_infra::projections::OrderBookProjection;
use turnstile_infra::{
    BoxOffice, BoxOfficeConfig, InMemoryCatalog, LoggingNotifier, NotificationRelay,
    SettlementOutcome, StoreBackend, SystemClock,
};
use turnstile_ticketing::{EventId, EventListing, PaymentMethod, SaleWindow, TicketType, TicketTypeId};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = BoxOfficeConfig::from_env().context("invalid configuration")?;
    turnstile_observability::init_with(&config.log.filter, config.log.json);

    match config.store.backend {
        StoreBackend::Memory => {
            tracing::info!("using in-memory event store");
            walkthrough(Arc::new(InMemoryEventStore::new()), &config)
        }
        StoreBackend::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let store = PostgresEventStore::connect(url, config.store.max_connections)
                .await
                .context("failed to connect to postgres")?;
            store.ensure_schema().await.context("failed to create schema")?;
            tracing::info!("using postgres event store");
            walkthrough(Arc::new(store), &config)
        }
    }
}

fn walkthrough<S: EventStore>(store: S, config: &BoxOfficeConfig) -> anyhow::Result<()> {
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let relay = NotificationRelay::spawn(&bus, LoggingNotifier)?;
    let catalog = Arc::new(InMemoryCatalog::new());

    let event_id = EventId::new(AggregateId::new());
    catalog.upsert_event(EventListing::published(event_id))?;
    let general = TicketTypeId::new(AggregateId::new());
    catalog.upsert_ticket_type(TicketType::new(
        general,
        event_id,
        "General admission",
        Decimal::new(4500, 2),
        3,
    )?)?;
    let vip = TicketTypeId::new(AggregateId::new());
    catalog.upsert_ticket_type(
        TicketType::new(vip, event_id, "VIP", Decimal::new(15000, 2), 1)?
            .with_vip(true)
            .with_sale_window(SaleWindow::new(None, Some(Utc::now() + Duration::days(30)))?),
    )?;

    let office = BoxOffice::new(store, bus, catalog, Arc::new(SystemClock), config);

    for availability in office.list_for_event(event_id)? {
        tracing::info!(
            ticket_type = %availability.name,
            price = %availability.unit_price,
            available = availability.available,
            on_sale = availability.on_sale,
            "listing"
        );
    }

    let alice = UserId::new();
    let bob = UserId::new();

    let alice_order = office.open_order(alice, event_id, vip)?;
    tracing::info!(order_id = %alice_order.id, "alice holds the only VIP unit");
    match office.open_order(bob, event_id, vip) {
        Err(err) => tracing::info!(code = err.code(), "bob is turned away"),
        Ok(order) => anyhow::bail!("VIP oversold to order {}", order.id),
    }

    let declined = office.record_payment(alice_order.id, PaymentMethod::CreditCard, None, None)?;
    office.settle_payment(
        declined.id,
        SettlementOutcome::Failed {
            reason: "card declined".to_string(),
        },
    )?;
    tracing::info!(
        available = office.available_units(vip)?,
        "declined card keeps the reservation"
    );

    let paid = office.record_payment(
        alice_order.id,
        PaymentMethod::Paypal,
        None,
        Some("PAY-7781".to_string()),
    )?;
    let confirmed = office.settle_payment(
        paid.id,
        SettlementOutcome::Completed {
            transaction_ref: None,
        },
    )?;
    tracing::info!(status = confirmed.status.as_str(), "alice is confirmed");

    let refunded = office.refund_payment(paid.id)?;
    tracing::info!(
        status = refunded.status.as_str(),
        available = office.available_units(vip)?,
        "refund released the VIP unit"
    );

    let bob_order = office.open_order(bob, event_id, vip)?;
    let bob_general = office.open_order(bob, event_id, general)?;
    office.cancel_order(bob_general.id)?;
    tracing::info!(order_id = %bob_order.id, "bob got the VIP unit on the second try");

    let report = office.recover_stale_attempts()?;
    tracing::info!(failed = report.failed.len(), "stale payment sweep");

    let order_book = OrderBookProjection::in_memory();
    order_book.rebuild_from_store(office.store())?;
    for entry in order_book.orders_for_user(bob) {
        tracing::info!(
            order_id = %entry.order_id,
            status = entry.status.as_str(),
            total = %entry.total_price,
            "bob's order"
        );
    }

    relay.shutdown();
    Ok(())
}
