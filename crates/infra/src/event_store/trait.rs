use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use turnstile_core::{AggregateId, ExpectedVersion};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Use `UncommittedEvent::from_typed()` to build one from a typed domain event: the
/// payload is serialized to JSON and the event metadata (`event_type`, version,
/// `occurred_at`) is captured next to the stream metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub record_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are stream-scoped, start at 1 and have no gaps. The stream
/// revision is the sequence number of its last event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub record_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Deserialize the payload into the typed domain event.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, EventStoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            EventStoreError::Corrupt(format!(
                "cannot decode {} #{} of {}: {e}",
                self.event_type, self.sequence_number, self.aggregate_id
            ))
        })
    }

    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> turnstile_events::EventEnvelope<JsonValue> {
        turnstile_events::EventEnvelope::new(
            self.record_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// One stream's share of an atomic commit.
///
/// An append with no events is a read guard: the commit fails unless the stream
/// is still at `expected_version`, but nothing is written to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

impl StreamAppend {
    pub fn new(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        expected_version: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            expected_version,
            events,
        }
    }

    pub fn is_guard(&self) -> bool {
        self.events.is_empty()
    }

    /// Every event must belong to this append's stream.
    pub(crate) fn validate(&self) -> Result<(), EventStoreError> {
        for (idx, e) in self.events.iter().enumerate() {
            if e.aggregate_id != self.aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "event {idx} targets {} inside the append for {}",
                    e.aggregate_id, self.aggregate_id
                )));
            }
            if e.aggregate_type != self.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "event {idx} is '{}' inside a '{}' append",
                    e.aggregate_type, self.aggregate_type
                )));
            }
        }
        Ok(())
    }
}

/// Reject commits that name the same stream twice.
pub(crate) fn validate_commit(appends: &[StreamAppend]) -> Result<(), EventStoreError> {
    for (idx, append) in appends.iter().enumerate() {
        append.validate()?;
        if appends[..idx]
            .iter()
            .any(|earlier| earlier.aggregate_id == append.aggregate_id)
        {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {} appears twice in one commit",
                append.aggregate_id
            )));
        }
    }
    Ok(())
}

/// Event store operation error.
///
/// Infrastructure errors only; domain failures never reach the store.
///
/// - **Concurrency**: a stream was not at the expected version (a racing writer won)
/// - **AggregateTypeMismatch**: the stream belongs to another aggregate type
/// - **InvalidAppend**: malformed commit (mixed streams, duplicate streams)
/// - **Corrupt**: a stored record cannot be read back
/// - **Backend**: the storage backend failed (connection, IO, poisoned lock)
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Append-only event store.
///
/// Events live in streams, one per aggregate instance, keyed by `aggregate_id`.
///
/// ## Commit semantics
///
/// `commit()` is the only write primitive. For every `StreamAppend` it checks the
/// stream revision against `expected_version`; if every check passes, all events
/// are written with sequence numbers continuing each stream. If any check fails,
/// nothing is written and `Concurrency` is returned. Implementations must make
/// the checks and the writes one atomic step with respect to other commits.
///
/// ## Load semantics
///
/// `load_stream()` returns one stream in sequence order (empty if it does not
/// exist). `load_by_type()` returns every record of an aggregate type in commit order.
pub trait EventStore: Send + Sync {
    /// Atomically append to several streams.
    fn commit(&self, appends: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream of one aggregate.
    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every record of an aggregate type, in commit order.
    fn load_by_type(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError>;

}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn commit(&self, appends: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).commit(appends)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn load_by_type(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_by_type(aggregate_type)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        record_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: turnstile_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            record_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}
