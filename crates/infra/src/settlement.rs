//! Settlement coordinator: binds payment outcomes to order transitions.
//!
//! Every operation here commits the payment stream and the order stream (and,
//! for refunds and timeouts, the pool stream) in one unit of work, so an order is
//! never confirmed without a completed attempt and never canceled while still
//! holding its unit.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use turnstile_core::AggregateId;
use turnstile_events::{EventBus, EventEnvelope};
use turnstile_ticketing::{
    CancelReason, CompletePayment, ConfirmOrder, FailPayment, OrderCommand, OrderId,
    OrderSnapshot, OrderStatus, PaymentAttempt, PaymentCommand, PaymentId, PaymentMethod,
    PaymentSnapshot, PaymentStatus, RecordPayment, RefundOrder, RefundPayment, TicketingError,
    PAYMENT_AGGREGATE_TYPE,
};

use crate::clock::Clock;
use crate::command_dispatcher::{CommandDispatcher, Loaded, UnitOfWork};
use crate::config::SettlementConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_store::EventStore;
use crate::orders::{snapshot_of, OrderStateMachine};

const TIMEOUT_REASON: &str = "payment timed out";

/// Result reported by the payment processor for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Completed { transaction_ref: Option<String> },
    Failed { reason: String },
}

/// What one stale-payment sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Attempts moved from pending to failed.
    pub failed: Vec<PaymentId>,
    /// Orders canceled because their attempt timed out.
    pub canceled: Vec<OrderId>,
    /// Attempts skipped after losing a race; the next sweep picks them up.
    pub skipped: Vec<PaymentId>,
}

pub struct SettlementCoordinator<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    orders: OrderStateMachine<S, B>,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl<S, B> SettlementCoordinator<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, B>>,
        orders: OrderStateMachine<S, B>,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            dispatcher,
            orders,
            clock,
            config,
        }
    }

    pub fn load(&self, payment_id: PaymentId) -> EngineResult<Loaded<PaymentAttempt>> {
        self.dispatcher.load(payment_id.0, PAYMENT_AGGREGATE_TYPE, |id| {
            PaymentAttempt::empty(PaymentId::new(id))
        })
    }

    pub fn get(&self, payment_id: PaymentId) -> EngineResult<Option<PaymentSnapshot>> {
        Ok(self.load(payment_id)?.aggregate.snapshot())
    }

    /// Open a new pending attempt against a pending order.
    ///
    /// `amount_hint` defaults to the order's price snapshot. The order stream is
    /// guarded so an attempt cannot be recorded against an order that was
    /// confirmed or canceled concurrently.
    pub fn record_payment(
        &self,
        order_id: OrderId,
        method: PaymentMethod,
        amount_hint: Option<Decimal>,
        transaction_ref: Option<String>,
    ) -> EngineResult<PaymentSnapshot> {
        let now = self.clock.now();
        let order = self.orders.load(order_id)?;
        let total_price = order
            .aggregate
            .total_price()
            .ok_or_else(EngineError::not_found)?;
        if order.aggregate.status() != OrderStatus::Pending {
            return Err(TicketingError::invalid_transition(format!(
                "cannot record a payment for a {} order",
                order.aggregate.status().as_str()
            ))
            .into());
        }

        let payment_id = PaymentId::new(AggregateId::new());
        let mut payment = self.load(payment_id)?;
        let mut unit = UnitOfWork::new();
        unit.decide(
            &mut payment,
            &PaymentCommand::RecordPayment(RecordPayment {
                payment_id,
                order_id,
                amount: amount_hint.unwrap_or(total_price),
                method,
                transaction_ref,
                occurred_at: now,
            }),
        )?;
        unit.guard(&order);
        self.dispatcher.commit(unit)?;

        info!(payment_id = %payment_id, order_id = %order_id, "payment recorded");
        payment
            .aggregate
            .snapshot()
            .ok_or_else(EngineError::not_found)
    }

    /// Apply a processor outcome.
    ///
    /// `Completed` confirms the order in the same commit; a second completion for
    /// the same order fails because the order is no longer pending. `Failed`
    /// leaves the order pending and its unit held.
    pub fn settle(
        &self,
        payment_id: PaymentId,
        outcome: SettlementOutcome,
    ) -> EngineResult<OrderSnapshot> {
        let now = self.clock.now();
        let mut payment = self.load(payment_id)?;
        let order_id = payment
            .aggregate
            .order_id()
            .ok_or_else(EngineError::not_found)?;
        let mut order = self.orders.load(order_id)?;
        let mut unit = UnitOfWork::new();

        match &outcome {
            SettlementOutcome::Completed { transaction_ref } => {
                unit.decide(
                    &mut payment,
                    &PaymentCommand::CompletePayment(CompletePayment {
                        payment_id,
                        transaction_ref: transaction_ref.clone(),
                        occurred_at: now,
                    }),
                )?;
                unit.decide(
                    &mut order,
                    &OrderCommand::ConfirmOrder(ConfirmOrder {
                        order_id,
                        payment_id,
                        occurred_at: now,
                    }),
                )?;
            }
            SettlementOutcome::Failed { reason } => {
                unit.decide(
                    &mut payment,
                    &PaymentCommand::FailPayment(FailPayment {
                        payment_id,
                        reason: reason.clone(),
                        occurred_at: now,
                    }),
                )?;
            }
        }
        self.dispatcher.commit(unit)?;

        info!(
            payment_id = %payment_id,
            order_id = %order_id,
            payment_status = payment.aggregate.status().as_str(),
            order_status = order.aggregate.status().as_str(),
            "payment settled"
        );
        snapshot_of(&order)
    }

    /// Refund the completed attempt that confirmed its order.
    ///
    /// Marks the attempt refunded, cancels the order and releases its unit.
    pub fn refund(&self, payment_id: PaymentId) -> EngineResult<OrderSnapshot> {
        let now = self.clock.now();
        let mut payment = self.load(payment_id)?;
        let order_id = payment
            .aggregate
            .order_id()
            .ok_or_else(EngineError::not_found)?;
        let mut order = self.orders.load(order_id)?;
        let mut unit = UnitOfWork::new();

        // The order checks that this attempt is the one that confirmed it.
        unit.decide(
            &mut order,
            &OrderCommand::RefundOrder(RefundOrder {
                order_id,
                payment_id,
                occurred_at: now,
            }),
        )?;
        unit.decide(
            &mut payment,
            &PaymentCommand::RefundPayment(RefundPayment {
                payment_id,
                occurred_at: now,
            }),
        )?;
        let ticket_type_id = order
            .aggregate
            .ticket_type_id()
            .ok_or_else(EngineError::not_found)?;
        self.orders
            .ledger()
            .release(&mut unit, ticket_type_id, order_id, now)?;
        self.dispatcher.commit(unit)?;

        info!(payment_id = %payment_id, order_id = %order_id, "payment refunded");
        snapshot_of(&order)
    }

    /// Fail every attempt left pending longer than the configured timeout.
    ///
    /// With `release_on_timeout`, a still-pending order behind a timed-out
    /// attempt is canceled in the same commit and its unit released, unless
    /// another attempt on that order is still pending inside the timeout. An attempt
    /// that loses a race is skipped, not retried; storage failures abort the sweep.
    pub fn recover_stale_attempts(&self) -> EngineResult<RecoveryReport> {
        let now = self.clock.now();
        let timeout = i64::try_from(self.config.payment_timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);

        let mut seen = HashSet::new();
        let mut attempts = Vec::new();
        for record in self.dispatcher.store().load_by_type(PAYMENT_AGGREGATE_TYPE)? {
            if seen.insert(record.aggregate_id) {
                attempts.push(self.load(PaymentId::new(record.aggregate_id))?);
            }
        }

        // Orders with an attempt still inside the timeout are being paid for and
        // must keep their unit even when an older attempt goes stale.
        let in_flight: HashSet<OrderId> = attempts
            .iter()
            .filter(|payment| !is_stale(payment, now, timeout))
            .filter(|payment| payment.aggregate.status() == PaymentStatus::Pending)
            .filter_map(|payment| payment.aggregate.order_id())
            .collect();

        let mut report = RecoveryReport::default();
        for payment in attempts {
            let payment_id = payment.aggregate.id_typed();
            match self.recover_one(payment, now, timeout, &in_flight) {
                Ok(None) => {}
                Ok(Some(canceled)) => {
                    report.failed.push(payment_id);
                    report.canceled.extend(canceled);
                }
                Err(err) if err.is_retryable() => {
                    warn!(payment_id = %payment_id, error = %err, "stale payment skipped");
                    report.skipped.push(payment_id);
                }
                Err(err) => return Err(err),
            }
        }

        if !report.failed.is_empty() || !report.skipped.is_empty() {
            info!(
                failed = report.failed.len(),
                canceled = report.canceled.len(),
                skipped = report.skipped.len(),
                "stale payment recovery finished"
            );
        }
        Ok(report)
    }

    /// `Ok(None)` when the attempt is not stale, else the order it canceled, if any.
    fn recover_one(
        &self,
        mut payment: Loaded<PaymentAttempt>,
        now: DateTime<Utc>,
        timeout: Duration,
        in_flight: &HashSet<OrderId>,
    ) -> EngineResult<Option<Option<OrderId>>> {
        if payment.aggregate.status() != PaymentStatus::Pending
            || !is_stale(&payment, now, timeout)
        {
            return Ok(None);
        }
        let payment_id = payment.aggregate.id_typed();

        let mut unit = UnitOfWork::new();
        unit.decide(
            &mut payment,
            &PaymentCommand::FailPayment(FailPayment {
                payment_id,
                reason: TIMEOUT_REASON.to_string(),
                occurred_at: now,
            }),
        )?;

        let mut canceled = None;
        if self.config.release_on_timeout {
            let order_id = payment
                .aggregate
                .order_id()
                .ok_or_else(EngineError::not_found)?;
            let mut order = self.orders.load(order_id)?;
            if order.aggregate.status() == OrderStatus::Pending && !in_flight.contains(&order_id) {
                self.orders.stage_cancel(
                    &mut unit,
                    &mut order,
                    CancelReason::PaymentTimedOut { payment_id },
                    now,
                )?;
                canceled = Some(order_id);
            } else {
                unit.guard(&order);
            }
        }

        self.dispatcher.commit(unit)?;
        warn!(payment_id = %payment_id, canceled_order = ?canceled, "stale payment failed");
        Ok(Some(canceled))
    }
}

fn is_stale(payment: &Loaded<PaymentAttempt>, now: DateTime<Utc>, timeout: Duration) -> bool {
    payment
        .aggregate
        .recorded_at()
        .is_some_and(|recorded_at| now - recorded_at >= timeout)
}
