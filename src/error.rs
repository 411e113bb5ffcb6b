use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::coaching::CoachingError;

/// The main error type for coachline handlers.
#[derive(Debug, thiserror::Error)]
pub enum CoachlineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A message or purchase was refused by a consumption limit.
    #[error("Rejected ({reason}): {message}")]
    Rejected {
        reason: &'static str,
        message: String,
    },

    /// The charge succeeded but its entitlement was not written.
    #[error("Payment {payment_reference} succeeded but was not recorded: {message}")]
    PaymentNotRecorded {
        payment_reference: String,
        message: String,
    },

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Standard error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_reference: Option<String>,
}

impl CoachlineError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status code this error maps to.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Rejected { reason, .. } => {
                if *reason == "daily_limit_reached" {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::FORBIDDEN
                }
            }
            Self::PaymentNotRecorded { .. } | Self::Internal(_) | Self::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message safe to return to clients.
    ///
    /// Server errors are replaced with a generic message; the full error is
    /// only written to the server log.
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(_) | Self::BadRequest(_) | Self::Rejected { .. } => self.to_string(),
            Self::RequestTimeout => "Request timeout".to_string(),
            Self::PaymentNotRecorded { .. } => {
                "Payment received but not yet recorded".to_string()
            }
            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::NotImplemented(_) => "Not implemented".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
        }
    }

    fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Rejected { reason, .. } => Some(reason),
            Self::PaymentNotRecorded { .. } => Some("entitlement_persist_failure"),
            _ => None,
        }
    }

    /// Payment a client or operator must reconcile, if any.
    fn payment_reference(&self) -> Option<&str> {
        match self {
            Self::PaymentNotRecorded {
                payment_reference, ..
            } => Some(payment_reference),
            _ => None,
        }
    }
}

impl IntoResponse for CoachlineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let body = ErrorResponse {
            error: self.safe_message(),
            error_id,
            reason: self.reason(),
            payment_reference: self.payment_reference().map(String::from),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for coachline handlers
pub type Result<T> = std::result::Result<T, CoachlineError>;

impl From<serde_json::Error> for CoachlineError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CoachlineError::BadRequest(format!("JSON error: {}", err))
        } else {
            CoachlineError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<CoachingError> for CoachlineError {
    fn from(err: CoachingError) -> Self {
        match &err {
            CoachingError::PackageNotFound { .. }
            | CoachingError::EntitlementNotFound { .. }
            | CoachingError::ConversationNotFound { .. } => Self::NotFound(err.to_string()),

            CoachingError::InvalidInput { .. }
            | CoachingError::InvalidPaymentEvent { .. }
            | CoachingError::QuotaResolution { .. }
            | CoachingError::InvalidWebhookSignature
            | CoachingError::WebhookTimestampExpired { .. }
            | CoachingError::InvalidWebhookPayload { .. } => Self::BadRequest(err.to_string()),

            CoachingError::ChatExpired { .. }
            | CoachingError::ClipsExhausted { .. }
            | CoachingError::DailyLimitReached { .. } => Self::Rejected {
                reason: err.reason_code(),
                message: err.to_string(),
            },

            CoachingError::ProcessorTimeout { .. } => Self::RequestTimeout,

            CoachingError::RoutingUnavailable { .. } | CoachingError::WebhookSecretMissing => {
                Self::ServiceUnavailable(err.to_string())
            }

            CoachingError::EntitlementPersistFailure {
                payment_reference,
                message,
            } => Self::PaymentNotRecorded {
                payment_reference: payment_reference.clone(),
                message: message.clone(),
            },

            CoachingError::NotImplemented { feature } => Self::NotImplemented(feature.clone()),

            CoachingError::ProcessorApiError { http_status, .. } => match http_status {
                Some(400..=499) => Self::BadRequest(err.to_string()),
                _ => Self::Internal(err.to_string()),
            },

            CoachingError::TransferFailed { .. }
            | CoachingError::Store { .. }
            | CoachingError::Internal { .. } => Self::Internal(err.to_string()),
        }
    }
}
