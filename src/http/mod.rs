//! HTTP surface for the coaching pipeline.
//!
//! Provides the response wrappers and the axum router over a
//! [`CoachingService`](crate::coaching::CoachingService).

pub mod response;
pub mod routes;

pub use response::{ApiResponse, CreatedResponse, IssueResponse, JsonResponse, NoContentResponse};
pub use routes::{router, DEFAULT_TRANSFER_LIMIT, SIGNATURE_HEADER};
