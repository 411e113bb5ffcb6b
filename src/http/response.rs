use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::coaching::{Entitlement, IssueOutcome, RoutingStatus, TransferRecord};

/// Standard JSON response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }

    /// Create a 201 Created response
    pub fn created(data: T) -> CreatedResponse<T> {
        CreatedResponse { data }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            StatusCode::BAD_REQUEST
        };

        (status, Json(self)).into_response()
    }
}

/// 201 Created response
#[derive(Debug, Serialize)]
pub struct CreatedResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> IntoResponse for CreatedResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::CREATED, Json(self.data)).into_response()
    }
}

/// 204 No Content response
#[derive(Debug, Clone, Copy)]
pub struct NoContentResponse;

impl IntoResponse for NoContentResponse {
    fn into_response(self) -> Response {
        StatusCode::NO_CONTENT.into_response()
    }
}

/// Body returned for an issuance, new or repeated.
#[derive(Debug, Serialize)]
pub struct IssueResponse {
    pub entitlement: Entitlement,
    /// False when the payment had already been issued.
    pub newly_issued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferRecord>,
    /// Set when routing failed and the payment needs reconciliation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_error: Option<String>,
}

impl From<IssueOutcome> for IssueResponse {
    fn from(outcome: IssueOutcome) -> Self {
        match outcome {
            IssueOutcome::AlreadyIssued { entitlement } => Self {
                entitlement,
                newly_issued: false,
                conversation_id: None,
                transfer: None,
                routing_error: None,
            },
            IssueOutcome::Issued(report) => {
                let report = *report;
                let (transfer, routing_error) = match report.routing {
                    RoutingStatus::Routed(record) => (Some(record), None),
                    RoutingStatus::Failed(e) => (None, Some(e.to_string())),
                };
                Self {
                    entitlement: report.entitlement,
                    newly_issued: true,
                    conversation_id: report.conversation.map(|c| c.id),
                    transfer,
                    routing_error,
                }
            }
        }
    }
}

/// Convenience type alias for JSON responses
pub type JsonResponse<T> = Result<Json<T>, crate::error::CoachlineError>;
