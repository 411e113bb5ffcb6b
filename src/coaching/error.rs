//! Coaching-specific error types.
//!
//! The variants follow the pipeline's failure taxonomy: validation errors,
//! consumption refusals, routing failures and post-charge persistence
//! failures are all distinct so callers can tell a declined message from a
//! charge that succeeded but could not be recorded.

use std::fmt;

use chrono::{DateTime, Utc};

/// Result alias used throughout the coaching pipeline.
pub type CoachingResult<T> = std::result::Result<T, CoachingError>;

/// Coaching pipeline errors.
///
/// Converted to [`CoachlineError`](crate::CoachlineError) for HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoachingError {
    // Validation errors
    /// A caller-supplied field is malformed.
    InvalidInput { field: String, reason: String },
    /// A payment event is missing data needed to issue an entitlement.
    InvalidPaymentEvent { message: String },

    // Catalog errors
    /// No package exists for the sport and tier.
    PackageNotFound { sport: String, tier: String },
    /// Neither the payment hints nor the catalog yield a quota.
    QuotaResolution {
        payment_reference: String,
        reason: String,
    },

    // Lookup errors
    /// The entitlement does not exist.
    EntitlementNotFound { entitlement_id: String },
    /// The conversation does not exist.
    ConversationNotFound { conversation_id: String },

    // Post-charge persistence
    /// The charge succeeded but the entitlement could not be written.
    EntitlementPersistFailure {
        payment_reference: String,
        message: String,
    },

    // Consumption errors
    /// The linked entitlement has expired.
    ChatExpired {
        conversation_id: String,
        expired_at: DateTime<Utc>,
    },
    /// Every clip in the allowance has been used.
    ClipsExhausted {
        conversation_id: String,
        allowance: u32,
    },
    /// The player reached today's text message cap.
    DailyLimitReached { conversation_id: String, cap: u32 },

    // Routing errors
    /// The provider has no usable connected account.
    RoutingUnavailable { provider_id: String, reason: String },
    /// The explicit transfer call failed.
    TransferFailed {
        payment_reference: String,
        message: String,
    },

    // Processor errors
    /// A processor call did not finish within the configured timeout.
    ProcessorTimeout { operation: String, timeout_secs: u64 },
    /// The processor returned an error.
    ProcessorApiError {
        operation: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidWebhookSignature,
    /// Webhook timestamp is outside the tolerance window.
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },
    /// No endpoint secret is configured, so no delivery can be verified.
    WebhookSecretMissing,

    // General errors
    /// A code path that exists in the event model but has no handler yet.
    NotImplemented { feature: String },
    /// The ledger store failed.
    Store { message: String },
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for CoachingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }
            Self::InvalidPaymentEvent { message } => {
                write!(f, "Invalid payment event: {}", message)
            }
            Self::PackageNotFound { sport, tier } => {
                write!(f, "No package for sport '{}' tier '{}'", sport, tier)
            }
            Self::QuotaResolution { payment_reference, reason } => {
                write!(
                    f,
                    "Could not resolve quota for payment '{}': {}",
                    payment_reference, reason
                )
            }
            Self::EntitlementNotFound { entitlement_id } => {
                write!(f, "Entitlement not found: {}", entitlement_id)
            }
            Self::ConversationNotFound { conversation_id } => {
                write!(f, "Conversation not found: {}", conversation_id)
            }
            Self::EntitlementPersistFailure { payment_reference, message } => {
                write!(
                    f,
                    "Payment '{}' succeeded but the entitlement could not be saved: {}",
                    payment_reference, message
                )
            }
            Self::ChatExpired { conversation_id, expired_at } => {
                write!(
                    f,
                    "Coaching access for conversation '{}' expired at {}",
                    conversation_id,
                    expired_at.to_rfc3339()
                )
            }
            Self::ClipsExhausted { conversation_id, allowance } => {
                write!(
                    f,
                    "All {} video clips used for conversation '{}'",
                    allowance, conversation_id
                )
            }
            Self::DailyLimitReached { conversation_id, cap } => {
                write!(
                    f,
                    "Daily limit of {} messages reached for conversation '{}'",
                    cap, conversation_id
                )
            }
            Self::RoutingUnavailable { provider_id, reason } => {
                write!(f, "Cannot route funds to provider '{}': {}", provider_id, reason)
            }
            Self::TransferFailed { payment_reference, message } => {
                write!(f, "Transfer for payment '{}' failed: {}", payment_reference, message)
            }
            Self::ProcessorTimeout { operation, timeout_secs } => {
                write!(
                    f,
                    "Processor call '{}' timed out after {}s",
                    operation, timeout_secs
                )
            }
            Self::ProcessorApiError { operation, message, code, http_status } => {
                write!(f, "Processor error during '{}': {}", operation, message)?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::InvalidWebhookSignature => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::WebhookSecretMissing => write!(f, "Webhook secret is not configured"),
            Self::NotImplemented { feature } => write!(f, "Not implemented: {}", feature),
            Self::Store { message } => write!(f, "Ledger store error: {}", message),
            Self::Internal { message } => write!(f, "Internal coaching error: {}", message),
        }
    }
}

impl std::error::Error for CoachingError {}

impl CoachingError {
    /// Shorthand for an [`InvalidInput`](Self::InvalidInput) error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`Store`](Self::Store) error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Stable machine-readable code for the error.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::InvalidPaymentEvent { .. } => "invalid_payment_event",
            Self::PackageNotFound { .. } => "package_not_found",
            Self::QuotaResolution { .. } => "quota_resolution",
            Self::EntitlementNotFound { .. } => "entitlement_not_found",
            Self::ConversationNotFound { .. } => "conversation_not_found",
            Self::EntitlementPersistFailure { .. } => "entitlement_persist_failure",
            Self::ChatExpired { .. } => "chat_expired",
            Self::ClipsExhausted { .. } => "clips_exhausted",
            Self::DailyLimitReached { .. } => "daily_limit_reached",
            Self::RoutingUnavailable { .. } => "routing_unavailable",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::ProcessorTimeout { .. } => "processor_timeout",
            Self::ProcessorApiError { .. } => "processor_error",
            Self::InvalidWebhookSignature => "invalid_webhook_signature",
            Self::WebhookTimestampExpired { .. } => "webhook_timestamp_expired",
            Self::InvalidWebhookPayload { .. } => "invalid_webhook_payload",
            Self::WebhookSecretMissing => "webhook_secret_missing",
            Self::NotImplemented { .. } => "not_implemented",
            Self::Store { .. } => "store_error",
            Self::Internal { .. } => "internal",
        }
    }

    /// Consumption refusals a player can fix by purchasing again.
    #[must_use]
    pub fn is_consumption_error(&self) -> bool {
        matches!(
            self,
            Self::ChatExpired { .. } | Self::ClipsExhausted { .. } | Self::DailyLimitReached { .. }
        )
    }

    /// Errors raised after money has moved (or been committed) that need
    /// manual reconciliation.
    #[must_use]
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            Self::EntitlementPersistFailure { .. }
                | Self::RoutingUnavailable { .. }
                | Self::TransferFailed { .. }
        )
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidInput { .. }
            | Self::InvalidPaymentEvent { .. }
            | Self::PackageNotFound { .. }
            | Self::QuotaResolution { .. }
            | Self::EntitlementNotFound { .. }
            | Self::ConversationNotFound { .. }
            | Self::ChatExpired { .. }
            | Self::ClipsExhausted { .. }
            | Self::DailyLimitReached { .. }
            | Self::InvalidWebhookSignature
            | Self::WebhookTimestampExpired { .. }
            | Self::InvalidWebhookPayload { .. } => true,
            Self::ProcessorApiError { http_status, .. } => {
                matches!(http_status, Some(400..=499))
            }
            _ => false,
        }
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Check if a caller may retry the same request.
    ///
    /// Routing failures are deliberately not retryable: money may already
    /// have moved and a blind retry could pay twice.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::EntitlementPersistFailure { .. } | Self::Store { .. } => true,
            Self::ProcessorApiError { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoachingError::PackageNotFound {
            sport: "curling".to_string(),
            tier: "2".to_string(),
        };
        assert_eq!(err.to_string(), "No package for sport 'curling' tier '2'");

        let err = CoachingError::DailyLimitReached {
            conversation_id: "conv_1".to_string(),
            cap: 5,
        };
        assert_eq!(
            err.to_string(),
            "Daily limit of 5 messages reached for conversation 'conv_1'"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = CoachingError::ClipsExhausted {
            conversation_id: "conv_1".to_string(),
            allowance: 3,
        };
        assert!(err.is_client_error());
        assert!(err.is_consumption_error());
        assert!(!err.is_retryable());

        let err = CoachingError::TransferFailed {
            payment_reference: "pi_1".to_string(),
            message: "declined".to_string(),
        };
        assert!(err.is_server_error());
        assert!(err.needs_reconciliation());
        assert!(!err.is_retryable());

        let err = CoachingError::EntitlementPersistFailure {
            payment_reference: "pi_1".to_string(),
            message: "timeout".to_string(),
        };
        assert!(err.needs_reconciliation());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_processor_error_display() {
        let err = CoachingError::ProcessorApiError {
            operation: "create_transfer".to_string(),
            message: "insufficient funds".to_string(),
            code: Some("balance_insufficient".to_string()),
            http_status: Some(400),
        };
        assert_eq!(
            err.to_string(),
            "Processor error during 'create_transfer': insufficient funds (code: balance_insufficient) [HTTP 400]"
        );
        assert!(err.is_client_error());
    }
}
