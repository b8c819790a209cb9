use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use turnstile_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use turnstile_events::Event;

use crate::error::TicketingError;
use crate::order::OrderId;

pub const PAYMENT_AGGREGATE_TYPE: &str = "ticketing.payment";

/// Payment attempt identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub AggregateId);

impl PaymentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PaymentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    Paypal,
    BankTransfer,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// Point-in-time view of a payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Recorded {
    order_id: OrderId,
    amount: Decimal,
    method: PaymentMethod,
    recorded_at: DateTime<Utc>,
}

/// Aggregate root: PaymentAttempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAttempt {
    id: PaymentId,
    recorded: Option<Recorded>,
    status: PaymentStatus,
    transaction_ref: Option<String>,
    failure_reason: Option<String>,
    settled_at: Option<DateTime<Utc>>,
    version: u64,
}

impl PaymentAttempt {
    pub fn empty(id: PaymentId) -> Self {
        Self {
            id,
            recorded: None,
            status: PaymentStatus::Pending,
            transaction_ref: None,
            failure_reason: None,
            settled_at: None,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> PaymentId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.recorded.is_some()
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.recorded.as_ref().map(|r| r.order_id)
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded.as_ref().map(|r| r.recorded_at)
    }

    pub fn snapshot(&self) -> Option<PaymentSnapshot> {
        let recorded = self.recorded.as_ref()?;
        Some(PaymentSnapshot {
            id: self.id,
            order_id: recorded.order_id,
            amount: recorded.amount,
            method: recorded.method,
            status: self.status,
            transaction_ref: self.transaction_ref.clone(),
            failure_reason: self.failure_reason.clone(),
            recorded_at: recorded.recorded_at,
            settled_at: self.settled_at,
            version: self.version,
        })
    }
}

impl AggregateRoot for PaymentAttempt {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RecordPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayment {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub transaction_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompletePayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayment {
    pub payment_id: PaymentId,
    pub transaction_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailPayment {
    pub payment_id: PaymentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPayment {
    pub payment_id: PaymentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentCommand {
    RecordPayment(RecordPayment),
    CompletePayment(CompletePayment),
    FailPayment(FailPayment),
    RefundPayment(RefundPayment),
}

/// Event: PaymentRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecorded {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub transaction_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub transaction_ref: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentRefunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRefunded {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEvent {
    PaymentRecorded(PaymentRecorded),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    PaymentRefunded(PaymentRefunded),
}

impl PaymentEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            PaymentEvent::PaymentRecorded(e) => e.order_id,
            PaymentEvent::PaymentCompleted(e) => e.order_id,
            PaymentEvent::PaymentFailed(e) => e.order_id,
            PaymentEvent::PaymentRefunded(e) => e.order_id,
        }
    }
}

impl Event for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentRecorded(_) => "ticketing.payment.recorded",
            PaymentEvent::PaymentCompleted(_) => "ticketing.payment.completed",
            PaymentEvent::PaymentFailed(_) => "ticketing.payment.failed",
            PaymentEvent::PaymentRefunded(_) => "ticketing.payment.refunded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PaymentEvent::PaymentRecorded(e) => e.occurred_at,
            PaymentEvent::PaymentCompleted(e) => e.occurred_at,
            PaymentEvent::PaymentFailed(e) => e.occurred_at,
            PaymentEvent::PaymentRefunded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PaymentAttempt {
    type Command = PaymentCommand;
    type Event = PaymentEvent;
    type Error = TicketingError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PaymentEvent::PaymentRecorded(e) => {
                self.id = e.payment_id;
                self.recorded = Some(Recorded {
                    order_id: e.order_id,
                    amount: e.amount,
                    method: e.method,
                    recorded_at: e.occurred_at,
                });
                self.transaction_ref = e.transaction_ref.clone();
                self.status = PaymentStatus::Pending;
            }
            PaymentEvent::PaymentCompleted(e) => {
                self.status = PaymentStatus::Completed;
                if e.transaction_ref.is_some() {
                    self.transaction_ref = e.transaction_ref.clone();
                }
                self.settled_at = Some(e.occurred_at);
            }
            PaymentEvent::PaymentFailed(e) => {
                self.status = PaymentStatus::Failed;
                self.failure_reason = Some(e.reason.clone());
                self.settled_at = Some(e.occurred_at);
            }
            PaymentEvent::PaymentRefunded(_) => {
                self.status = PaymentStatus::Refunded;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PaymentCommand::RecordPayment(cmd) => self.handle_record(cmd),
            PaymentCommand::CompletePayment(cmd) => self.handle_complete(cmd),
            PaymentCommand::FailPayment(cmd) => self.handle_fail(cmd),
            PaymentCommand::RefundPayment(cmd) => self.handle_refund(cmd),
        }
    }
}

impl PaymentAttempt {
    fn ensure_payment_id(&self, payment_id: PaymentId) -> Result<(), DomainError> {
        if self.id != payment_id {
            return Err(DomainError::invariant("payment_id mismatch"));
        }
        Ok(())
    }

    fn recorded_order(&self, payment_id: PaymentId) -> Result<OrderId, DomainError> {
        self.ensure_payment_id(payment_id)?;
        self.order_id().ok_or_else(DomainError::not_found)
    }

    fn ensure_pending(&self, action: &str) -> Result<(), TicketingError> {
        if self.status != PaymentStatus::Pending {
            return Err(TicketingError::invalid_transition(format!(
                "cannot {action} a {} payment",
                self.status.as_str()
            )));
        }
        Ok(())
    }

    fn handle_record(&self, cmd: &RecordPayment) -> Result<Vec<PaymentEvent>, TicketingError> {
        self.ensure_payment_id(cmd.payment_id)?;

        if self.exists() {
            return Err(DomainError::conflict("payment attempt already recorded").into());
        }
        if cmd.amount.is_sign_negative() {
            return Err(DomainError::validation("amount cannot be negative").into());
        }

        Ok(vec![PaymentEvent::PaymentRecorded(PaymentRecorded {
            payment_id: cmd.payment_id,
            order_id: cmd.order_id,
            amount: cmd.amount,
            method: cmd.method,
            transaction_ref: cmd.transaction_ref.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(
        &self,
        cmd: &CompletePayment,
    ) -> Result<Vec<PaymentEvent>, TicketingError> {
        let order_id = self.recorded_order(cmd.payment_id)?;
        self.ensure_pending("complete")?;

        Ok(vec![PaymentEvent::PaymentCompleted(PaymentCompleted {
            payment_id: cmd.payment_id,
            order_id,
            transaction_ref: cmd.transaction_ref.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail(&self, cmd: &FailPayment) -> Result<Vec<PaymentEvent>, TicketingError> {
        let order_id = self.recorded_order(cmd.payment_id)?;
        self.ensure_pending("fail")?;

        Ok(vec![PaymentEvent::PaymentFailed(PaymentFailed {
            payment_id: cmd.payment_id,
            order_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_refund(&self, cmd: &RefundPayment) -> Result<Vec<PaymentEvent>, TicketingError> {
        let order_id = self.recorded_order(cmd.payment_id)?;

        if self.status != PaymentStatus::Completed {
            return Err(TicketingError::not_refundable(format!(
                "payment is {}, not completed",
                self.status.as_str()
            )));
        }

        Ok(vec![PaymentEvent::PaymentRefunded(PaymentRefunded {
            payment_id: cmd.payment_id,
            order_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn recorded() -> PaymentAttempt {
        let payment_id = PaymentId::new(AggregateId::new());
        let mut attempt = PaymentAttempt::empty(payment_id);
        let cmd = RecordPayment {
            payment_id,
            order_id: OrderId::new(AggregateId::new()),
            amount: Decimal::new(5000, 2),
            method: PaymentMethod::CreditCard,
            transaction_ref: None,
            occurred_at: test_time(),
        };
        let events = attempt
            .handle(&PaymentCommand::RecordPayment(cmd))
            .unwrap();
        attempt.apply(&events[0]);
        attempt
    }

    fn complete(attempt: &mut PaymentAttempt) {
        let cmd = CompletePayment {
            payment_id: attempt.id_typed(),
            transaction_ref: Some("txn-42".to_string()),
            occurred_at: test_time(),
        };
        let events = attempt
            .handle(&PaymentCommand::CompletePayment(cmd))
            .unwrap();
        attempt.apply(&events[0]);
    }

    #[test]
    fn record_starts_pending() {
        let attempt = recorded();
        assert!(attempt.exists());
        assert_eq!(attempt.status(), PaymentStatus::Pending);
        assert!(attempt.snapshot().unwrap().settled_at.is_none());
    }

    #[test]
    fn record_rejects_negative_amount() {
        let payment_id = PaymentId::new(AggregateId::new());
        let err = PaymentAttempt::empty(payment_id)
            .handle(&PaymentCommand::RecordPayment(RecordPayment {
                payment_id,
                order_id: OrderId::new(AggregateId::new()),
                amount: Decimal::new(-1, 0),
                method: PaymentMethod::Paypal,
                transaction_ref: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, TicketingError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn complete_sets_settlement_fields() {
        let mut attempt = recorded();
        complete(&mut attempt);

        let snap = attempt.snapshot().unwrap();
        assert_eq!(snap.status, PaymentStatus::Completed);
        assert_eq!(snap.transaction_ref.as_deref(), Some("txn-42"));
        assert!(snap.settled_at.is_some());
    }

    #[test]
    fn terminal_attempts_cannot_be_settled_again() {
        let mut attempt = recorded();
        let fail = PaymentCommand::FailPayment(FailPayment {
            payment_id: attempt.id_typed(),
            reason: "card declined".to_string(),
            occurred_at: test_time(),
        });
        let events = attempt.handle(&fail).unwrap();
        attempt.apply(&events[0]);
        assert_eq!(
            attempt.snapshot().unwrap().failure_reason.as_deref(),
            Some("card declined")
        );

        let err = attempt
            .handle(&PaymentCommand::CompletePayment(CompletePayment {
                payment_id: attempt.id_typed(),
                transaction_ref: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn only_completed_attempts_are_refundable() {
        let mut attempt = recorded();
        let refund = PaymentCommand::RefundPayment(RefundPayment {
            payment_id: attempt.id_typed(),
            occurred_at: test_time(),
        });
        assert_eq!(attempt.handle(&refund).unwrap_err().code(), "not_refundable");

        complete(&mut attempt);
        let events = attempt.handle(&refund).unwrap();
        attempt.apply(&events[0]);
        assert_eq!(attempt.status(), PaymentStatus::Refunded);

        // A refunded attempt cannot be refunded twice.
        assert_eq!(attempt.handle(&refund).unwrap_err().code(), "not_refundable");
    }

    #[test]
    fn settle_unknown_attempt_is_not_found() {
        let payment_id = PaymentId::new(AggregateId::new());
        let err = PaymentAttempt::empty(payment_id)
            .handle(&PaymentCommand::FailPayment(FailPayment {
                payment_id,
                reason: "timeout".to_string(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
