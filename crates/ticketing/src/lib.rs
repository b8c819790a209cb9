//! Ticketing domain module (event-sourced).
//!
//! Business rules for selling limited-capacity tickets: the per-ticket-type
//! reservation pool, the order lifecycle and payment attempts. Everything here is
//! deterministic domain logic (no IO, no clock, no storage); the infrastructure
//! layer loads streams, feeds commands and commits the resulting events.

pub mod error;
pub mod notice;
pub mod order;
pub mod payment;
pub mod pool;
pub mod ticket_type;

pub use error::{DenialReason, TicketingError, TicketingResult};
pub use notice::{NoticeKind, OrderNotice};
pub use order::{
    CancelOrder, CancelReason, ConfirmOrder, OpenOrder, Order, OrderCanceled, OrderCommand,
    OrderConfirmed, OrderEvent, OrderId, OrderOpened, OrderSnapshot, OrderStatus, RefundOrder,
    ORDER_AGGREGATE_TYPE,
};
pub use payment::{
    CompletePayment, FailPayment, PaymentAttempt, PaymentCommand, PaymentCompleted,
    PaymentEvent, PaymentFailed, PaymentId, PaymentMethod, PaymentRecorded, PaymentRefunded,
    PaymentSnapshot, PaymentStatus, RecordPayment, RefundPayment, PAYMENT_AGGREGATE_TYPE,
};
pub use pool::{
    PoolCommand, PoolEvent, ReleaseUnit, ReserveUnit, TicketPool, UnitReleased, UnitReserved,
    POOL_AGGREGATE_TYPE,
};
pub use ticket_type::{EventId, EventListing, SaleWindow, TicketType, TicketTypeId};
