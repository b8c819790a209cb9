use std::collections::HashMap;
use std::sync::RwLock;

use turnstile_core::AggregateId;

use super::r#trait::{
    validate_commit, EventStore, EventStoreError, StoredEvent, StreamAppend,
};

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<AggregateId, Vec<StoredEvent>>,
    /// Every stored event in commit order.
    log: Vec<StoredEvent>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. All version checks and writes of a commit happen
/// under one write guard, which makes commits linearizable.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    fn check(inner: &Inner, append: &StreamAppend) -> Result<(), EventStoreError> {
        let stream = inner
            .streams
            .get(&append.aggregate_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let current = Self::current_version(stream);

        if !append.expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {}: expected {:?}, found {current}",
                append.aggregate_id, append.expected_version
            )));
        }

        // Enforce aggregate type stability across the stream.
        if let Some(existing) = stream.first() {
            if existing.aggregate_type != append.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted commit with '{}'",
                    existing.aggregate_type, append.aggregate_type
                )));
            }
        }
        Ok(())
    }
}

impl EventStore for InMemoryEventStore {
    fn commit(&self, appends: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_commit(&appends)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        // Phase 1: every check passes before anything is written.
        for append in &appends {
            Self::check(&inner, append)?;
        }

        // Phase 2: assign sequence numbers and append.
        let mut committed = Vec::new();
        for append in appends {
            if append.is_guard() {
                continue;
            }
            let Inner { streams, log } = &mut *inner;
            let stream = streams.entry(append.aggregate_id).or_default();
            let mut next = Self::current_version(stream) + 1;
            for e in append.events {
                let stored = StoredEvent {
                    record_id: e.record_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                log.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(inner.streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn load_by_type(&self, aggregate_type: &str) -> Result<Vec<StoredEvent>, EventStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(inner
            .log
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::UncommittedEvent;
    use chrono::Utc;
    use turnstile_core::ExpectedVersion;
    use uuid::Uuid;

    fn event(aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            record_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({ "n": 1 }),
        }
    }

    fn write(
        store: &InMemoryEventStore,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        expected: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        store.commit(vec![StreamAppend::new(
            aggregate_id,
            aggregate_type,
            expected,
            vec![event(aggregate_id, aggregate_type)],
        )])
    }

    fn guard(aggregate_id: AggregateId, aggregate_type: &str, version: u64) -> StreamAppend {
        StreamAppend::new(aggregate_id, aggregate_type, ExpectedVersion::Exact(version), vec![])
    }

    #[test]
    fn commit_assigns_sequence_numbers_per_stream() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        let committed = store
            .commit(vec![
                StreamAppend::new(a, "test.a", ExpectedVersion::NoStream, vec![event(a, "test.a"), event(a, "test.a")]),
                StreamAppend::new(b, "test.b", ExpectedVersion::NoStream, vec![event(b, "test.b")]),
            ])
            .unwrap();

        let seqs: Vec<u64> = committed.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 1]);
        assert_eq!(store.load_stream(a).unwrap().len(), 2);
        assert_eq!(store.load_by_type("test.b").unwrap().len(), 1);
    }

    #[test]
    fn failed_check_writes_nothing() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        write(&store, b, "test.b", ExpectedVersion::NoStream).unwrap();

        let err = store
            .commit(vec![
                StreamAppend::new(a, "test.a", ExpectedVersion::NoStream, vec![event(a, "test.a")]),
                StreamAppend::new(b, "test.b", ExpectedVersion::NoStream, vec![event(b, "test.b")]),
            ])
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert!(store.load_stream(a).unwrap().is_empty());
        assert_eq!(store.load_stream(b).unwrap().len(), 1);
    }

    #[test]
    fn stale_guard_aborts_the_commit() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let guarded = AggregateId::new();
        write(&store, guarded, "test.g", ExpectedVersion::NoStream).unwrap();
        write(&store, guarded, "test.g", ExpectedVersion::Exact(1)).unwrap();

        let err = store
            .commit(vec![
                StreamAppend::new(a, "test.a", ExpectedVersion::NoStream, vec![event(a, "test.a")]),
                guard(guarded, "test.g", 1),
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        store
            .commit(vec![
                StreamAppend::new(a, "test.a", ExpectedVersion::NoStream, vec![event(a, "test.a")]),
                guard(guarded, "test.g", 2),
            ])
            .unwrap();
        assert_eq!(store.load_stream(guarded).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_stream_in_commit_is_rejected() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let err = store
            .commit(vec![
                StreamAppend::new(a, "test.a", ExpectedVersion::Any, vec![event(a, "test.a")]),
                guard(a, "test.a", 0),
            ])
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[test]
    fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        write(&store, a, "test.a", ExpectedVersion::NoStream).unwrap();

        let err = write(&store, a, "test.other", ExpectedVersion::Exact(1)).unwrap_err();
        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }
}
