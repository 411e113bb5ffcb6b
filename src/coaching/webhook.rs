//! Processor webhook handling.
//!
//! Verifies signatures, deduplicates deliveries by event id, and dispatches:
//!
//! | Event | Action |
//! |---|---|
//! | `payment_intent.succeeded` | issue entitlement |
//! | `checkout.session.completed` (paid) | issue entitlement |
//! | `account.updated` | refresh connected account |
//! | `payout.*`, `invoice.*` | [`CoachingError::NotImplemented`] |
//! | anything else | [`WebhookOutcome::Ignored`] |
//!
//! Only processed events are marked. Payout and invoice events are answered
//! with an error, never acknowledged, so the processor keeps redelivering
//! them until a handler exists. A verifier without a secret refuses every
//! delivery.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::accounts::CoachAccountResolver;
use super::audit::{CoachingAuditEvent, NoOpAuditLogger, SharedAuditLogger};
use super::error::{CoachingError, CoachingResult};
use super::issuer::{metadata_keys, EntitlementIssuer, IssueOutcome, PaymentEvent, RoutingStatus};
use super::processor::{AccountStatus, PaymentProcessor};
use super::storage::LedgerStore;
use crate::clock::SharedClock;

/// Default signature timestamp tolerance.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies webhook signatures.
///
/// The header has the form `t=<unix seconds>,v1=<hex hmac>`, where the HMAC
/// is SHA-256 over `"{t}.{payload}"` keyed by the endpoint secret.
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance_secs: i64,
    clock: SharedClock,
}

impl WebhookVerifier {
    /// Create a verifier.
    #[must_use]
    pub fn new(secret: SecretString, clock: SharedClock) -> Self {
        Self {
            secret,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
            clock,
        }
    }

    /// Set the accepted clock skew in seconds.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verify the signature header and parse the event.
    pub fn verify_event(&self, payload: &[u8], signature_header: &str) -> CoachingResult<WebhookEvent> {
        let secret = self.endpoint_secret()?;
        let parts = parse_signature_header(signature_header)?;

        let age_seconds = self.clock.now().timestamp() - parts.timestamp;
        if age_seconds.abs() > self.tolerance_secs {
            return Err(CoachingError::WebhookTimestampExpired { age_seconds });
        }

        let expected = compute_signature(secret, parts.timestamp, payload)?;
        let expected_bytes = hex::decode(expected).map_err(|_| CoachingError::Internal {
            message: "hex decode error".to_string(),
        })?;
        let provided_bytes =
            hex::decode(&parts.signature).map_err(|_| CoachingError::InvalidWebhookSignature)?;

        if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
            return Err(CoachingError::InvalidWebhookSignature);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "coachline::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            CoachingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })
    }

    /// Build a signature header for a payload, e.g. for replaying events locally.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> CoachingResult<String> {
        let signature = compute_signature(self.endpoint_secret()?, timestamp, payload)?;
        Ok(format!("t={},v1={}", timestamp, signature))
    }

    fn endpoint_secret(&self) -> CoachingResult<&str> {
        let secret = self.secret.expose_secret();
        if secret.trim().is_empty() {
            tracing::error!(
                target: "coachline::webhook",
                "Webhook secret is not configured, refusing delivery"
            );
            return Err(CoachingError::WebhookSecretMissing);
        }
        Ok(secret)
    }
}

/// Parsed webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    pub created: i64,
}

/// Webhook event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    /// The object that triggered the event.
    pub object: serde_json::Value,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Not relevant to the pipeline.
    Ignored,
    /// Seen before (idempotency).
    AlreadyProcessed,
}

impl WebhookOutcome {
    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::AlreadyProcessed => "already_processed",
        }
    }
}

/// Dispatches verified webhook events.
pub struct WebhookHandler<S: LedgerStore, P: PaymentProcessor> {
    store: S,
    issuer: Arc<EntitlementIssuer<S, P>>,
    accounts: Arc<CoachAccountResolver<S, P>>,
    clock: SharedClock,
    audit: SharedAuditLogger,
}

impl<S, P> WebhookHandler<S, P>
where
    S: LedgerStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Create a new webhook handler.
    #[must_use]
    pub fn new(
        store: S,
        issuer: Arc<EntitlementIssuer<S, P>>,
        accounts: Arc<CoachAccountResolver<S, P>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            issuer,
            accounts,
            clock,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Set the audit logger.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Process a verified event.
    pub async fn handle_event(&self, event: WebhookEvent) -> CoachingResult<WebhookOutcome> {
        if self.store.is_event_processed(&event.id).await? {
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let event_type = event.event_type.as_str();
        let outcome = match event_type {
            "payment_intent.succeeded" => self.handle_payment_succeeded(&event).await?,
            "checkout.session.completed" => self.handle_checkout_completed(&event).await?,
            "account.updated" => self.handle_account_updated(&event).await?,
            t if t.starts_with("payout.") || t.starts_with("invoice.") => {
                tracing::warn!(
                    target: "coachline::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "No handler for webhook event, leaving it for redelivery"
                );
                return Err(CoachingError::NotImplemented {
                    feature: format!("webhook event {}", event.event_type),
                });
            }
            _ => WebhookOutcome::Ignored,
        };

        if outcome == WebhookOutcome::Processed {
            self.store
                .mark_event_processed(&event.id, self.clock.now())
                .await?;
        }

        tracing::info!(
            target: "coachline::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.as_str(),
            "Webhook handled"
        );
        self.audit
            .log(CoachingAuditEvent::WebhookProcessed {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                outcome: outcome.as_str().to_string(),
            })
            .await;

        Ok(outcome)
    }

    async fn handle_payment_succeeded(&self, event: &WebhookEvent) -> CoachingResult<WebhookOutcome> {
        let object = object(event)?;
        let intent_id = required_str(object, "id")?;
        let metadata = metadata(object);

        let payment_reference = metadata
            .get(metadata_keys::PAYMENT_REFERENCE)
            .cloned()
            .unwrap_or_else(|| intent_id.to_string());
        let charge_id = object
            .get("latest_charge")
            .and_then(|v| v.as_str())
            .unwrap_or(intent_id)
            .to_string();
        let amount = object
            .get("amount_received")
            .or_else(|| object.get("amount"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| payload_error("missing amount"))?;

        let mut payment = PaymentEvent::from_metadata(
            payment_reference,
            Some(charge_id),
            amount,
            required_str(object, "currency")?.to_string(),
            optional_str(object, "customer"),
            &metadata,
        )?;
        if payment.destination_account.is_none() {
            payment.destination_account = object
                .get("transfer_data")
                .and_then(|t| t.get("destination"))
                .and_then(|v| v.as_str())
                .map(String::from);
        }

        self.issue(&payment).await
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> CoachingResult<WebhookOutcome> {
        let object = object(event)?;

        if object.get("payment_status").and_then(|v| v.as_str()) != Some("paid") {
            return Ok(WebhookOutcome::Ignored);
        }

        let session_id = required_str(object, "id")?;
        let metadata = metadata(object);
        let payment_intent = optional_str(object, "payment_intent");
        let payment_reference = metadata
            .get(metadata_keys::PAYMENT_REFERENCE)
            .cloned()
            .or_else(|| payment_intent.clone())
            .unwrap_or_else(|| session_id.to_string());
        let amount = object
            .get("amount_total")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| payload_error("missing amount_total"))?;

        let payment = PaymentEvent::from_metadata(
            payment_reference,
            payment_intent,
            amount,
            required_str(object, "currency")?.to_string(),
            optional_str(object, "customer"),
            &metadata,
        )?;

        self.issue(&payment).await
    }

    async fn handle_account_updated(&self, event: &WebhookEvent) -> CoachingResult<WebhookOutcome> {
        let object = object(event)?;
        let flag = |key: &str| object.get(key).and_then(|v| v.as_bool()).unwrap_or(false);

        let status = AccountStatus {
            account_ref: required_str(object, "id")?.to_string(),
            charges_enabled: flag("charges_enabled"),
            payouts_enabled: flag("payouts_enabled"),
            details_submitted: flag("details_submitted"),
        };

        match self.accounts.apply_account_update(&status).await? {
            Some(account) => {
                self.audit
                    .log(CoachingAuditEvent::AccountUpdated {
                        provider_id: account.provider_id,
                        account_ref: status.account_ref,
                        payouts_enabled: account.payouts_enabled,
                    })
                    .await;
                Ok(WebhookOutcome::Processed)
            }
            None => Ok(WebhookOutcome::Ignored),
        }
    }

    async fn issue(&self, payment: &PaymentEvent) -> CoachingResult<WebhookOutcome> {
        let outcome = self.issuer.issue(payment).await?;
        if let IssueOutcome::Issued(report) = &outcome {
            if let RoutingStatus::Failed(e) = &report.routing {
                tracing::warn!(
                    target: "coachline::webhook",
                    payment_reference = %payment.payment_reference,
                    error = %e,
                    "Entitlement issued but funds were not routed"
                );
            }
        }
        Ok(WebhookOutcome::Processed)
    }
}

fn object(event: &WebhookEvent) -> CoachingResult<&serde_json::Map<String, serde_json::Value>> {
    event
        .data
        .object
        .as_object()
        .ok_or_else(|| payload_error("event data is not an object"))
}

fn required_str<'a>(
    object: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> CoachingResult<&'a str> {
    object
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| payload_error(&format!("missing {}", key)))
}

fn optional_str(object: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Metadata values as strings; numbers and booleans are stringified.
fn metadata(object: &serde_json::Map<String, serde_json::Value>) -> HashMap<String, String> {
    object
        .get("metadata")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((k.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn payload_error(message: &str) -> CoachingError {
    CoachingError::InvalidWebhookPayload {
        message: message.to_string(),
    }
}

/// Parsed signature header parts.
struct SignatureParts {
    timestamp: i64,
    signature: String,
}

fn parse_signature_header(header: &str) -> CoachingResult<SignatureParts> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(CoachingError::InvalidWebhookSignature)?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signature = Some(value.trim().to_string()),
            _ => {}
        }
    }

    Ok(SignatureParts {
        timestamp: timestamp.ok_or(CoachingError::InvalidWebhookSignature)?,
        signature: signature.ok_or(CoachingError::InvalidWebhookSignature)?,
    })
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> CoachingResult<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| CoachingError::Internal {
        message: "HMAC error".to_string(),
    })?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    const PAYLOAD: &str = r#"{"id":"evt_1","type":"test","data":{"object":{}},"created":1714557600}"#;

    fn verifier(clock: &ManualClock) -> WebhookVerifier {
        WebhookVerifier::new(
            SecretString::from("whsec_test".to_string()),
            Arc::new(clock.clone()),
        )
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
    }

    #[test]
    fn test_parse_signature_header() {
        let parts = parse_signature_header("t=1234567890,v1=abc123def456").unwrap();
        assert_eq!(parts.timestamp, 1234567890);
        assert_eq!(parts.signature, "abc123def456");
        assert!(parse_signature_header("invalid").is_err());
        assert!(parse_signature_header("t=1").is_err());
    }

    #[test]
    fn test_verify_valid_signature() {
        let clock = clock();
        let verifier = verifier(&clock);
        let header = verifier
            .sign(PAYLOAD.as_bytes(), Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().timestamp())
            .unwrap();

        let event = verifier.verify_event(PAYLOAD.as_bytes(), &header).unwrap();
        assert_eq!(event.id, "evt_1");
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let clock = clock();
        let verifier = verifier(&clock);
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().timestamp();
        let header = verifier.sign(PAYLOAD.as_bytes(), ts).unwrap();

        let tampered = PAYLOAD.replace("evt_1", "evt_2");
        let err = verifier.verify_event(tampered.as_bytes(), &header).unwrap_err();
        assert_eq!(err, CoachingError::InvalidWebhookSignature);

        let err = verifier
            .verify_event(PAYLOAD.as_bytes(), &format!("t={},v1=not_hex", ts))
            .unwrap_err();
        assert_eq!(err, CoachingError::InvalidWebhookSignature);
    }

    #[test]
    fn test_verify_rejects_old_timestamp() {
        let clock = clock();
        let verifier = verifier(&clock);
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().timestamp();
        let header = verifier.sign(PAYLOAD.as_bytes(), ts).unwrap();

        clock.advance(chrono::Duration::seconds(301));
        let err = verifier.verify_event(PAYLOAD.as_bytes(), &header).unwrap_err();
        assert!(matches!(err, CoachingError::WebhookTimestampExpired { age_seconds: 301 }));
    }

    #[test]
    fn test_empty_secret_refuses_every_delivery() {
        let clock = clock();
        let verifier = WebhookVerifier::new(
            SecretString::from(String::new()),
            Arc::new(clock.clone()),
        );
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().timestamp();
        let forged = format!(
            "t={},v1={}",
            ts,
            compute_signature("", ts, PAYLOAD.as_bytes()).unwrap()
        );

        let err = verifier.verify_event(PAYLOAD.as_bytes(), &forged).unwrap_err();
        assert_eq!(err, CoachingError::WebhookSecretMissing);
        assert_eq!(
            verifier.sign(PAYLOAD.as_bytes(), ts).unwrap_err(),
            CoachingError::WebhookSecretMissing
        );
    }

    #[test]
    fn test_metadata_stringifies_scalars() {
        let object = serde_json::json!({
            "metadata": {"clips": 7, "sport": "golf", "nested": {"a": 1}}
        });
        let map = metadata(object.as_object().unwrap());
        assert_eq!(map.get("clips").map(String::as_str), Some("7"));
        assert_eq!(map.get("sport").map(String::as_str), Some("golf"));
        assert!(!map.contains_key("nested"));
    }
}
