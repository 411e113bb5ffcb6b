//! Audit logging for the payment pipeline.
//!
//! Routing and post-charge persistence failures need a human to reconcile
//! them, so every money-relevant step emits an audit event. Implement
//! [`CoachingAuditLogger`] to ship them to a database or external service.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Audit event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoachingAuditEvent {
    /// Charge created for a package purchase.
    CheckoutCreated {
        charge_id: String,
        provider_id: String,
        sport: String,
        tier: String,
        amount: i64,
    },
    /// Entitlement written for a payment.
    EntitlementIssued {
        entitlement_id: String,
        payment_reference: String,
        provider_id: String,
        player_id: String,
        clip_allowance: u32,
    },
    /// A repeated delivery of an already-issued payment.
    EntitlementAlreadyIssued {
        payment_reference: String,
        entitlement_id: String,
    },
    /// The payment succeeded but the entitlement could not be written.
    EntitlementPersistFailed {
        payment_reference: String,
        error: String,
    },
    /// Funds routed (or recorded as routed) to a provider.
    TransferRecorded {
        payment_reference: String,
        provider_id: String,
        net_amount: i64,
        status: String,
    },
    /// Funds could not be routed.
    RoutingFailed {
        payment_reference: String,
        provider_id: String,
        error: String,
    },
    /// Connected account linked or updated.
    AccountUpdated {
        provider_id: String,
        account_ref: String,
        payouts_enabled: bool,
    },
    /// Webhook processed.
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
}

impl fmt::Display for CoachingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CheckoutCreated { charge_id, provider_id, sport, tier, amount } => {
                write!(
                    f,
                    "Checkout created: charge={}, provider={}, package={}/{}, amount={}",
                    charge_id, provider_id, sport, tier, amount
                )
            }
            Self::EntitlementIssued {
                entitlement_id,
                payment_reference,
                provider_id,
                player_id,
                clip_allowance,
            } => {
                write!(
                    f,
                    "Entitlement issued: entitlement={}, payment={}, provider={}, player={}, clips={}",
                    entitlement_id, payment_reference, provider_id, player_id, clip_allowance
                )
            }
            Self::EntitlementAlreadyIssued { payment_reference, entitlement_id } => {
                write!(
                    f,
                    "Entitlement already issued: payment={}, entitlement={}",
                    payment_reference, entitlement_id
                )
            }
            Self::EntitlementPersistFailed { payment_reference, error } => {
                write!(
                    f,
                    "Entitlement persist failed: payment={}, error={}",
                    payment_reference, error
                )
            }
            Self::TransferRecorded { payment_reference, provider_id, net_amount, status } => {
                write!(
                    f,
                    "Transfer recorded: payment={}, provider={}, net={}, status={}",
                    payment_reference, provider_id, net_amount, status
                )
            }
            Self::RoutingFailed { payment_reference, provider_id, error } => {
                write!(
                    f,
                    "Routing failed: payment={}, provider={}, error={}",
                    payment_reference, provider_id, error
                )
            }
            Self::AccountUpdated { provider_id, account_ref, payouts_enabled } => {
                write!(
                    f,
                    "Account updated: provider={}, account={}, payouts_enabled={}",
                    provider_id, account_ref, payouts_enabled
                )
            }
            Self::WebhookProcessed { event_id, event_type, outcome } => {
                write!(
                    f,
                    "Webhook processed: event={}, type={}, outcome={}",
                    event_id, event_type, outcome
                )
            }
        }
    }
}

/// Trait for audit logging backends.
#[async_trait]
pub trait CoachingAuditLogger: Send + Sync {
    /// Log an audit event.
    ///
    /// Implementations should swallow their own failures so auditing never
    /// disrupts payment processing.
    async fn log(&self, event: CoachingAuditEvent);
}

/// Shared audit logger.
pub type SharedAuditLogger = Arc<dyn CoachingAuditLogger>;

/// No-op audit logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl CoachingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: CoachingAuditEvent) {}
}

/// Tracing-based audit logger.
///
/// Failures are logged at WARN, everything else at INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl CoachingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: CoachingAuditEvent) {
        if event_is_failure(&event) {
            tracing::warn!(
                target: "coaching::audit",
                event_type = %event_kind(&event),
                "{}", event
            );
        } else {
            tracing::info!(
                target: "coaching::audit",
                event_type = %event_kind(&event),
                "{}", event
            );
        }
    }
}

/// Audit logger that keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditLogger {
    events: Arc<tokio::sync::Mutex<Vec<CoachingAuditEvent>>>,
}

impl MemoryAuditLogger {
    /// Create an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events logged so far.
    pub async fn events(&self) -> Vec<CoachingAuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl CoachingAuditLogger for MemoryAuditLogger {
    async fn log(&self, event: CoachingAuditEvent) {
        self.events.lock().await.push(event);
    }
}

/// Get the event kind as a string for structured logging.
fn event_kind(event: &CoachingAuditEvent) -> &'static str {
    match event {
        CoachingAuditEvent::CheckoutCreated { .. } => "checkout_created",
        CoachingAuditEvent::EntitlementIssued { .. } => "entitlement_issued",
        CoachingAuditEvent::EntitlementAlreadyIssued { .. } => "entitlement_already_issued",
        CoachingAuditEvent::EntitlementPersistFailed { .. } => "entitlement_persist_failed",
        CoachingAuditEvent::TransferRecorded { .. } => "transfer_recorded",
        CoachingAuditEvent::RoutingFailed { .. } => "routing_failed",
        CoachingAuditEvent::AccountUpdated { .. } => "account_updated",
        CoachingAuditEvent::WebhookProcessed { .. } => "webhook_processed",
    }
}

fn event_is_failure(event: &CoachingAuditEvent) -> bool {
    matches!(
        event,
        CoachingAuditEvent::EntitlementPersistFailed { .. } | CoachingAuditEvent::RoutingFailed { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_logger() {
        let logger = MemoryAuditLogger::new();

        logger
            .log(CoachingAuditEvent::EntitlementIssued {
                entitlement_id: "ent_1".to_string(),
                payment_reference: "pi_1".to_string(),
                provider_id: "coach_1".to_string(),
                player_id: "player_1".to_string(),
                clip_allowance: 7,
            })
            .await;
        logger
            .log(CoachingAuditEvent::RoutingFailed {
                payment_reference: "pi_1".to_string(),
                provider_id: "coach_1".to_string(),
                error: "no connected account".to_string(),
            })
            .await;

        let events = logger.events().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], CoachingAuditEvent::RoutingFailed { .. }));
    }

    #[test]
    fn test_event_display() {
        let event = CoachingAuditEvent::TransferRecorded {
            payment_reference: "pi_1".to_string(),
            provider_id: "coach_1".to_string(),
            net_amount: 4016,
            status: "paid".to_string(),
        };
        assert_eq!(
            event.to_string(),
            "Transfer recorded: payment=pi_1, provider=coach_1, net=4016, status=paid"
        );
    }

    #[test]
    fn test_event_kind() {
        let event = CoachingAuditEvent::EntitlementPersistFailed {
            payment_reference: String::new(),
            error: String::new(),
        };
        assert_eq!(event_kind(&event), "entitlement_persist_failed");
        assert!(event_is_failure(&event));
    }
}
