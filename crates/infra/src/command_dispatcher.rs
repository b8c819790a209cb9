//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! load stream(s) ──► rehydrate ──► decide (pure) ──► stage in UnitOfWork
//!                                                        │
//!                       publish (best effort) ◄── commit (atomic, all streams)
//! ```
//!
//! A `UnitOfWork` collects the decisions of several aggregates, each with the
//! version it was loaded at, and the store commits them all-or-nothing. That
//! makes "check the pool, then open the order" a single compare-and-append: if
//! any stream moved since it was loaded, nothing is written and the caller
//! gets a retryable conflict.
//!
//! This module contains no IO itself; it composes infrastructure traits.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use turnstile_core::{Aggregate, AggregateId, ExpectedVersion};
use turnstile_events::{EventBus, EventEnvelope};

use crate::error::{EngineError, EngineResult};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

/// An aggregate rehydrated from its stream, remembering the revision it was loaded at.
#[derive(Debug, Clone)]
pub struct Loaded<A> {
    pub aggregate: A,
    aggregate_id: AggregateId,
    aggregate_type: &'static str,
    loaded_version: u64,
}

impl<A> Loaded<A> {
    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &'static str {
        self.aggregate_type
    }

    /// Stream revision at load time (0 when the stream did not exist).
    pub fn loaded_version(&self) -> u64 {
        self.loaded_version
    }

    fn expected_version(&self) -> ExpectedVersion {
        if self.loaded_version == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(self.loaded_version)
        }
    }
}

/// Decisions staged across one or more streams, committed atomically.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    appends: Vec<StreamAppend>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a command against a loaded aggregate, apply the resulting events to it
    /// and stage them for commit at the version it was loaded at.
    pub fn decide<A>(
        &mut self,
        loaded: &mut Loaded<A>,
        command: &A::Command,
    ) -> EngineResult<Vec<A::Event>>
    where
        A: Aggregate,
        A::Error: Into<EngineError>,
        A::Event: turnstile_events::Event + Serialize,
    {
        let decided = loaded
            .aggregate
            .handle(command)
            .map_err(Into::<EngineError>::into)?;
        if decided.is_empty() {
            return Ok(decided);
        }

        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    loaded.aggregate_id,
                    loaded.aggregate_type,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        for ev in &decided {
            loaded.aggregate.apply(ev);
        }

        let append = self.append_for(loaded);
        append.events.extend(uncommitted);
        Ok(decided)
    }

    /// Require the stream to still be at its loaded version when committing,
    /// without writing to it.
    pub fn guard<A>(&mut self, loaded: &Loaded<A>) {
        self.append_for(loaded);
    }

    pub fn has_events(&self) -> bool {
        self.appends.iter().any(|a| !a.is_guard())
    }

    fn append_for<A>(&mut self, loaded: &Loaded<A>) -> &mut StreamAppend {
        let idx = match self
            .appends
            .iter()
            .position(|a| a.aggregate_id == loaded.aggregate_id)
        {
            Some(idx) => idx,
            None => {
                self.appends.push(StreamAppend::new(
                    loaded.aggregate_id,
                    loaded.aggregate_type,
                    loaded.expected_version(),
                    Vec::new(),
                ));
                self.appends.len() - 1
            }
        };
        &mut self.appends[idx]
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// ## Execution Guarantees
///
/// - **Atomicity**: a unit of work is committed all-or-nothing across its streams
/// - **Consistency**: every staged stream is checked against its loaded version
/// - **Publication after commit**: nothing is published unless the commit succeeded
///
/// ## At-Least-Once Delivery
///
/// Publication failures after a successful commit are logged and swallowed: the
/// events are durable and consumers can rebuild from the store.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Load and rehydrate one aggregate.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &'static str,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> EngineResult<Loaded<A>>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, aggregate_type, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;

        Ok(Loaded {
            aggregate,
            aggregate_id,
            aggregate_type,
            loaded_version: stream_version(&history),
        })
    }

    /// Commit a unit of work and publish what was written.
    pub fn commit(&self, unit: UnitOfWork) -> EngineResult<Vec<StoredEvent>> {
        if !unit.has_events() {
            return Ok(vec![]);
        }

        let committed = self.store.commit(unit.appends)?;

        for stored in &committed {
            if let Err(err) = self.bus.publish(stored.to_envelope()) {
                warn!(
                    aggregate_id = %stored.aggregate_id,
                    sequence_number = stored.sequence_number,
                    error = ?err,
                    "event publication failed after commit"
                );
            }
        }

        Ok(committed)
    }

}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    aggregate_type: &str,
    stream: &[StoredEvent],
) -> Result<(), EventStoreError> {
    // Sequence numbers must run 1, 2, 3, ... with no gaps.
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(EventStoreError::Corrupt(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream {aggregate_id} is '{}', expected '{aggregate_type}'",
                e.aggregate_type
            )));
        }
        let expected = idx as u64 + 1;
        if e.sequence_number != expected {
            return Err(EventStoreError::Corrupt(format!(
                "non-contiguous sequence_number in loaded stream (expected={expected}, found={})",
                e.sequence_number
            )));
        }
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), EventStoreError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = stored.decode()?;
        aggregate.apply(&ev);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use turnstile_core::{AggregateRoot, UserId};
    use turnstile_events::InMemoryEventBus;
    use turnstile_ticketing::{
        EventId, OpenOrder, Order, OrderCommand, OrderId, TicketTypeId, ORDER_AGGREGATE_TYPE,
    };

    use crate::event_store::InMemoryEventStore;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn dispatcher() -> (CommandDispatcher<Arc<InMemoryEventStore>, Bus>, Bus) {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        (
            CommandDispatcher::new(Arc::new(InMemoryEventStore::new()), bus.clone()),
            bus,
        )
    }

    fn open(order_id: OrderId) -> OrderCommand {
        OrderCommand::OpenOrder(OpenOrder {
            order_id,
            user_id: UserId::new(),
            event_id: EventId::new(AggregateId::new()),
            ticket_type_id: TicketTypeId::new(AggregateId::new()),
            total_price: Decimal::TEN,
            occurred_at: Utc::now(),
        })
    }

    fn load_order(
        d: &CommandDispatcher<Arc<InMemoryEventStore>, Bus>,
        order_id: OrderId,
    ) -> Loaded<Order> {
        d.load(order_id.0, ORDER_AGGREGATE_TYPE, |id| Order::empty(OrderId::new(id)))
            .unwrap()
    }

    fn commit_open(d: &CommandDispatcher<Arc<InMemoryEventStore>, Bus>, cmd: &OrderCommand) -> Loaded<Order> {
        let OrderCommand::OpenOrder(open) = cmd else {
            panic!("expected an open command");
        };
        let mut loaded = load_order(d, open.order_id);
        let mut unit = UnitOfWork::new();
        unit.decide(&mut loaded, cmd).unwrap();
        d.commit(unit).unwrap();
        loaded
    }

    #[test]
    fn commit_persists_and_publishes() {
        let (d, bus) = dispatcher();
        let sub = bus.subscribe();
        let order_id = OrderId::new(AggregateId::new());

        let loaded = commit_open(&d, &open(order_id));
        assert_eq!(loaded.aggregate.version(), 1);

        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.aggregate_id(), order_id.0);
        assert_eq!(envelope.event_type(), "ticketing.order.opened");

        let reloaded = load_order(&d, order_id);
        assert_eq!(reloaded.loaded_version(), 1);
        assert!(reloaded.aggregate.exists());
    }

    #[test]
    fn stale_unit_of_work_is_a_retryable_conflict() {
        let (d, _bus) = dispatcher();
        let order_id = OrderId::new(AggregateId::new());
        let cmd = open(order_id);

        let mut first = load_order(&d, order_id);
        let mut second = load_order(&d, order_id);

        let mut unit = UnitOfWork::new();
        unit.decide(&mut first, &cmd).unwrap();
        d.commit(unit).unwrap();

        let mut unit = UnitOfWork::new();
        unit.decide(&mut second, &cmd).unwrap();
        let err = d.commit(unit).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn empty_decisions_commit_nothing() {
        let (d, bus) = dispatcher();
        let sub = bus.subscribe();
        let order_id = OrderId::new(AggregateId::new());
        let cmd = open(order_id);
        commit_open(&d, &cmd);
        let _ = sub.try_recv();

        let mut loaded = load_order(&d, order_id);
        let mut unit = UnitOfWork::new();
        assert!(unit.decide(&mut loaded, &cmd).unwrap().is_empty());
        unit.guard(&loaded);
        assert!(!unit.has_events());
        assert!(d.commit(unit).unwrap().is_empty());
        assert!(sub.try_recv().is_err());
    }
}
