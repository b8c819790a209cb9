//! Event-sourcing mechanics: domain event contract, envelopes, pub/sub.
//!
//! Nothing here knows about tickets or orders.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
