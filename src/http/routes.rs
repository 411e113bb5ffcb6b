//! Coaching HTTP routes.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::response::{ApiResponse, CreatedResponse, IssueResponse, JsonResponse, NoContentResponse};
use crate::coaching::{
    CheckoutRequest, CheckoutSession, CoachAccount, CoachingService, Conversation, LedgerStore,
    Message, MessageType, PaymentProcessor, ProviderTransferReport, QuotaSnapshot,
    SendMessageRequest, SenderRole, WebhookOutcome,
};
use crate::error::{CoachlineError, Result};

/// Header carrying the processor's webhook signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Default number of transfers returned per provider.
pub const DEFAULT_TRANSFER_LIMIT: usize = 50;

type SharedService<S, P> = Arc<CoachingService<S, P>>;

/// Build the coaching router.
///
/// | Method | Path |
/// |---|---|
/// | POST | `/checkout` |
/// | POST | `/payments/webhook` |
/// | POST | `/payments/confirm` |
/// | GET | `/providers/:provider_id/transfers?limit=` |
/// | GET | `/providers/:provider_id/conversations` |
/// | POST | `/providers/:provider_id/account` |
/// | GET, POST | `/conversations/:conversation_id/messages` |
/// | GET | `/conversations/:conversation_id/quota` |
/// | POST | `/conversations/:conversation_id/read` |
pub fn router<S, P>(service: SharedService<S, P>) -> Router
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/checkout", post(create_checkout::<S, P>))
        .route("/payments/webhook", post(payment_webhook::<S, P>))
        .route("/payments/confirm", post(confirm_payment::<S, P>))
        .route("/providers/:provider_id/transfers", get(provider_transfers::<S, P>))
        .route(
            "/providers/:provider_id/conversations",
            get(provider_conversations::<S, P>),
        )
        .route("/providers/:provider_id/account", post(link_account::<S, P>))
        .route(
            "/conversations/:conversation_id/messages",
            get(list_messages::<S, P>).post(send_message::<S, P>),
        )
        .route("/conversations/:conversation_id/quota", get(quota::<S, P>))
        .route("/conversations/:conversation_id/read", post(mark_read::<S, P>))
        .with_state(service)
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "healthy" })
}

async fn create_checkout<S, P>(
    State(service): State<SharedService<S, P>>,
    Json(request): Json<CheckoutRequest>,
) -> Result<CreatedResponse<CheckoutSession>>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    let session = service.create_checkout(request).await?;
    Ok(ApiResponse::created(session))
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    received: bool,
    outcome: WebhookOutcome,
}

async fn payment_webhook<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> JsonResponse<WebhookAck>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoachlineError::bad_request("Missing webhook signature"))?;

    let outcome = service.handle_webhook(&body, signature).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

#[derive(Debug, Deserialize)]
struct ConfirmPaymentBody {
    charge_id: String,
}

async fn confirm_payment<S, P>(
    State(service): State<SharedService<S, P>>,
    Json(body): Json<ConfirmPaymentBody>,
) -> JsonResponse<IssueResponse>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    let outcome = service.confirm_payment(&body.charge_id).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
struct TransferQuery {
    limit: Option<usize>,
}

async fn provider_transfers<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(provider_id): Path<String>,
    Query(query): Query<TransferQuery>,
) -> JsonResponse<ProviderTransferReport>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    let limit = query.limit.unwrap_or(DEFAULT_TRANSFER_LIMIT);
    let report = service
        .get_provider_transfer_summary(&provider_id, Some(limit))
        .await?;
    Ok(Json(report))
}

async fn provider_conversations<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(provider_id): Path<String>,
) -> JsonResponse<Vec<Conversation>>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    Ok(Json(service.list_provider_conversations(&provider_id).await?))
}

#[derive(Debug, Deserialize)]
struct LinkAccountBody {
    account_ref: String,
}

async fn link_account<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(provider_id): Path<String>,
    Json(body): Json<LinkAccountBody>,
) -> Result<ApiResponse<CoachAccount>>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    let account = service
        .link_coach_account(&provider_id, &body.account_ref)
        .await?;
    Ok(ApiResponse::success_with_message(account, "Account linked"))
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    sender_id: String,
    role: SenderRole,
    #[serde(rename = "type")]
    message_type: MessageType,
    content: String,
}

async fn send_message<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<CreatedResponse<Message>>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    let message = service
        .send_message(SendMessageRequest {
            conversation_id,
            sender_id: body.sender_id,
            role: body.role,
            message_type: body.message_type,
            content: body.content,
        })
        .await?;
    Ok(ApiResponse::created(message))
}

async fn list_messages<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(conversation_id): Path<String>,
) -> JsonResponse<Vec<Message>>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    Ok(Json(service.list_messages(&conversation_id).await?))
}

async fn quota<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(conversation_id): Path<String>,
) -> JsonResponse<QuotaSnapshot>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    Ok(Json(service.get_remaining_quota(&conversation_id).await?))
}

#[derive(Debug, Deserialize)]
struct MarkReadBody {
    role: SenderRole,
}

async fn mark_read<S, P>(
    State(service): State<SharedService<S, P>>,
    Path(conversation_id): Path<String>,
    Json(body): Json<MarkReadBody>,
) -> Result<NoContentResponse>
where
    S: LedgerStore + Clone + 'static,
    P: PaymentProcessor + Clone + 'static,
{
    service.mark_read(&conversation_id, body.role).await?;
    Ok(NoContentResponse)
}
