//! Entitlement issuance.
//!
//! A payment event is delivered at least twice: once by the client's
//! synchronous confirmation and once by the processor webhook, in either
//! order and possibly concurrently. Issuance is therefore an insert-if-absent
//! keyed by payment reference; a conflict is a successful no-op.
//!
//! Order of operations for a new payment:
//!
//! 1. validate the event
//! 2. derive the quota (payment hints first, then the package catalog); a
//!    payment for a catalog package must match its price
//! 3. write the entitlement
//! 4. upsert the player/provider conversation
//! 5. route funds
//!
//! Funds are only routed once the entitlement is durably written.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;

use super::audit::{CoachingAuditEvent, NoOpAuditLogger, SharedAuditLogger};
use super::catalog::{PackageCatalog, Tier};
use super::conversation::ConversationManager;
use super::error::{CoachingError, CoachingResult};
use super::processor::{ChargeRecord, PaymentProcessor};
use super::router::{FundRouter, RoutingMode};
use super::storage::{
    Conversation, Entitlement, EntitlementStatus, InsertOutcome, LedgerStore, TransferRecord,
};
use crate::clock::SharedClock;

/// Charge metadata keys written at checkout and read back on payment.
pub mod metadata_keys {
    pub const PAYMENT_REFERENCE: &str = "payment_reference";
    pub const PROVIDER_ID: &str = "provider_id";
    pub const PLAYER_ID: &str = "player_id";
    pub const PLAYER_NAME: &str = "player_name";
    pub const SPORT: &str = "sport";
    pub const TIER: &str = "tier";
    pub const CLIPS: &str = "clips";
    pub const VALIDITY_DAYS: &str = "validity_days";
    pub const ROUTING_MODE: &str = "routing_mode";
    pub const DESTINATION_ACCOUNT: &str = "destination_account";
}

/// Player ids that never get a conversation.
pub const DEFAULT_PLACEHOLDER_PLAYERS: &[&str] = &["", "anonymous", "unauthenticated", "guest"];

/// A verified, successful payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub payment_reference: String,
    pub charge_id: Option<String>,
    pub provider_id: String,
    pub player_id: String,
    pub player_name: Option<String>,
    pub sport: String,
    pub tier: Option<Tier>,
    /// Amount paid, minor units.
    pub gross_amount: i64,
    pub currency: String,
    /// Overrides the package clip allowance when positive.
    pub clip_allowance_hint: Option<u32>,
    /// Overrides the package validity when positive.
    pub validity_days_hint: Option<u32>,
    pub routing_mode: RoutingMode,
    pub destination_account: Option<String>,
    pub customer_ref: Option<String>,
}

impl PaymentEvent {
    /// Build an event from a processor charge and its metadata.
    pub fn from_charge(charge: &ChargeRecord) -> CoachingResult<Self> {
        let payment_reference = charge
            .payment_reference
            .clone()
            .or_else(|| non_empty(&charge.metadata, metadata_keys::PAYMENT_REFERENCE))
            .unwrap_or_else(|| charge.id.clone());

        let mut event = Self::from_metadata(
            payment_reference,
            Some(charge.id.clone()),
            charge.amount,
            charge.currency.clone(),
            charge.customer_ref.clone(),
            &charge.metadata,
        )?;
        if event.destination_account.is_none() {
            event.destination_account = charge.destination_account.clone();
        }
        Ok(event)
    }

    /// Build an event from payment metadata.
    ///
    /// A missing or unknown routing mode falls back to separate transfer.
    pub fn from_metadata(
        payment_reference: String,
        charge_id: Option<String>,
        gross_amount: i64,
        currency: String,
        customer_ref: Option<String>,
        metadata: &HashMap<String, String>,
    ) -> CoachingResult<Self> {
        let provider_id = non_empty(metadata, metadata_keys::PROVIDER_ID).ok_or_else(|| {
            CoachingError::InvalidPaymentEvent {
                message: format!("payment '{}' has no provider_id", payment_reference),
            }
        })?;

        let routing_mode = match metadata.get(metadata_keys::ROUTING_MODE) {
            Some(value) => RoutingMode::parse(value),
            None => None,
        };
        let routing_mode = routing_mode.unwrap_or_else(|| {
            tracing::warn!(
                target: "coachline::issuer",
                payment_reference = %payment_reference,
                routing_mode = metadata.get(metadata_keys::ROUTING_MODE).map(String::as_str),
                "Payment has no usable routing mode, using separate transfer"
            );
            RoutingMode::SeparateTransfer
        });

        Ok(Self {
            payment_reference,
            charge_id,
            provider_id,
            player_id: metadata
                .get(metadata_keys::PLAYER_ID)
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            player_name: non_empty(metadata, metadata_keys::PLAYER_NAME),
            sport: metadata
                .get(metadata_keys::SPORT)
                .map(|v| v.trim().to_ascii_lowercase())
                .unwrap_or_default(),
            tier: metadata.get(metadata_keys::TIER).and_then(|v| Tier::parse(v)),
            gross_amount,
            currency: currency.to_ascii_lowercase(),
            clip_allowance_hint: positive_hint(metadata, metadata_keys::CLIPS),
            validity_days_hint: positive_hint(metadata, metadata_keys::VALIDITY_DAYS),
            routing_mode,
            destination_account: non_empty(metadata, metadata_keys::DESTINATION_ACCOUNT),
            customer_ref,
        })
    }

    /// Reject malformed events before any state change.
    pub fn validate(&self) -> CoachingResult<()> {
        if self.payment_reference.trim().is_empty() {
            return Err(CoachingError::InvalidPaymentEvent {
                message: "payment_reference is empty".to_string(),
            });
        }
        if self.provider_id.trim().is_empty() {
            return Err(CoachingError::InvalidPaymentEvent {
                message: "provider_id is empty".to_string(),
            });
        }
        if self.gross_amount < 0 {
            return Err(CoachingError::InvalidPaymentEvent {
                message: format!("gross_amount {} is negative", self.gross_amount),
            });
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CoachingError::InvalidPaymentEvent {
                message: format!("currency '{}' is not a 3-letter code", self.currency),
            });
        }
        Ok(())
    }
}

fn non_empty(metadata: &HashMap<String, String>, key: &str) -> Option<String> {
    metadata
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn positive_hint(metadata: &HashMap<String, String>, key: &str) -> Option<u32> {
    metadata
        .get(key)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
}

/// Outcome of issuing an entitlement for a payment.
#[derive(Debug, Clone)]
pub enum IssueOutcome {
    /// A new entitlement was written.
    Issued(Box<IssueReport>),
    /// The payment was already issued; nothing changed.
    AlreadyIssued { entitlement: Entitlement },
}

impl IssueOutcome {
    /// The entitlement for the payment, new or existing.
    #[must_use]
    pub fn entitlement(&self) -> &Entitlement {
        match self {
            Self::Issued(report) => &report.entitlement,
            Self::AlreadyIssued { entitlement } => entitlement,
        }
    }

    /// Check if this call wrote the entitlement.
    #[must_use]
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Issued(_))
    }
}

/// What happened after a new entitlement was written.
#[derive(Debug, Clone)]
pub struct IssueReport {
    pub entitlement: Entitlement,
    /// `None` for placeholder players or when the upsert failed.
    pub conversation: Option<Conversation>,
    pub conversation_error: Option<CoachingError>,
    pub routing: RoutingStatus,
}

/// Result of fund routing for a newly issued entitlement.
#[derive(Debug, Clone)]
pub enum RoutingStatus {
    Routed(TransferRecord),
    /// Needs manual reconciliation; the entitlement stands.
    Failed(CoachingError),
}

struct Quota {
    clip_allowance: u32,
    validity_days: u32,
}

/// Issues entitlements for successful payments.
pub struct EntitlementIssuer<S: LedgerStore, P: PaymentProcessor> {
    store: S,
    catalog: Arc<PackageCatalog>,
    conversations: ConversationManager<S>,
    router: FundRouter<S, P>,
    clock: SharedClock,
    audit: SharedAuditLogger,
    placeholder_players: Vec<String>,
}

impl<S, P> EntitlementIssuer<S, P>
where
    S: LedgerStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Create a new issuer.
    #[must_use]
    pub fn new(
        store: S,
        catalog: Arc<PackageCatalog>,
        router: FundRouter<S, P>,
        clock: SharedClock,
    ) -> Self {
        Self {
            conversations: ConversationManager::new(store.clone(), clock.clone()),
            store,
            catalog,
            router,
            clock,
            audit: Arc::new(NoOpAuditLogger),
            placeholder_players: DEFAULT_PLACEHOLDER_PLAYERS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Set the audit logger.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Set the player ids that never get a conversation.
    #[must_use]
    pub fn with_placeholder_players(mut self, ids: Vec<String>) -> Self {
        self.placeholder_players = ids;
        self
    }

    /// Issue the entitlement for a payment.
    ///
    /// Safe to call any number of times for the same payment.
    pub async fn issue(&self, event: &PaymentEvent) -> CoachingResult<IssueOutcome> {
        event.validate()?;

        if let Some(existing) = self
            .store
            .get_entitlement_by_payment(&event.payment_reference)
            .await?
        {
            return Ok(self.already_issued(existing).await);
        }

        let quota = self.resolve_quota(event)?;
        let now = self.clock.now();
        let entitlement = Entitlement {
            id: uuid::Uuid::new_v4().to_string(),
            payment_reference: event.payment_reference.clone(),
            provider_id: event.provider_id.clone(),
            player_id: event.player_id.clone(),
            sport: event.sport.clone(),
            tier: event.tier,
            gross_amount: event.gross_amount,
            currency: event.currency.clone(),
            clip_allowance: quota.clip_allowance,
            clips_consumed: 0,
            created_at: now,
            expires_at: now + Duration::days(i64::from(quota.validity_days)),
            status: EntitlementStatus::Active,
        };

        match self.store.insert_entitlement_if_absent(&entitlement).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::AlreadyExists(existing)) => {
                return Ok(self.already_issued(existing).await);
            }
            Err(e) => {
                tracing::error!(
                    target: "coachline::issuer",
                    payment_reference = %event.payment_reference,
                    provider_id = %event.provider_id,
                    error = %e,
                    "Payment succeeded but entitlement could not be written"
                );
                self.audit
                    .log(CoachingAuditEvent::EntitlementPersistFailed {
                        payment_reference: event.payment_reference.clone(),
                        error: e.to_string(),
                    })
                    .await;
                return Err(CoachingError::EntitlementPersistFailure {
                    payment_reference: event.payment_reference.clone(),
                    message: e.to_string(),
                });
            }
        }

        tracing::info!(
            target: "coachline::issuer",
            entitlement_id = %entitlement.id,
            payment_reference = %entitlement.payment_reference,
            provider_id = %entitlement.provider_id,
            player_id = %entitlement.player_id,
            clip_allowance = entitlement.clip_allowance,
            expires_at = %entitlement.expires_at,
            "Entitlement issued"
        );
        self.audit
            .log(CoachingAuditEvent::EntitlementIssued {
                entitlement_id: entitlement.id.clone(),
                payment_reference: entitlement.payment_reference.clone(),
                provider_id: entitlement.provider_id.clone(),
                player_id: entitlement.player_id.clone(),
                clip_allowance: entitlement.clip_allowance,
            })
            .await;

        let (conversation, conversation_error) = self.link_conversation(&entitlement).await;
        let routing = self.route(&entitlement, event).await;

        Ok(IssueOutcome::Issued(Box::new(IssueReport {
            entitlement,
            conversation,
            conversation_error,
            routing,
        })))
    }

    /// Check if a player id is a placeholder.
    #[must_use]
    pub fn is_placeholder_player(&self, player_id: &str) -> bool {
        let player_id = player_id.trim();
        player_id.is_empty()
            || self
                .placeholder_players
                .iter()
                .any(|p| p.eq_ignore_ascii_case(player_id))
    }

    fn resolve_quota(&self, event: &PaymentEvent) -> CoachingResult<Quota> {
        let package = event
            .tier
            .and_then(|tier| self.catalog.get(&event.sport, tier));

        if let Some(package) = package {
            if event.gross_amount != package.price {
                tracing::error!(
                    target: "coachline::issuer",
                    payment_reference = %event.payment_reference,
                    sport = %package.sport,
                    tier = %package.tier,
                    gross_amount = event.gross_amount,
                    price = package.price,
                    "Payment amount does not match package price"
                );
                return Err(CoachingError::QuotaResolution {
                    payment_reference: event.payment_reference.clone(),
                    reason: format!(
                        "amount {} does not match package price {}",
                        event.gross_amount, package.price
                    ),
                });
            }
        }

        let clip_allowance = event
            .clip_allowance_hint
            .filter(|n| *n > 0)
            .or_else(|| package.map(|p| p.clip_allowance));
        let validity_days = event
            .validity_days_hint
            .filter(|n| *n > 0)
            .or_else(|| package.map(|p| p.validity_days));

        match (clip_allowance, validity_days) {
            (Some(clip_allowance), Some(validity_days)) => Ok(Quota {
                clip_allowance,
                validity_days,
            }),
            _ => {
                let reason = match event.tier {
                    None => "no quota hints and no tier".to_string(),
                    Some(tier) if package.is_none() => {
                        format!("no package for sport '{}' tier '{}'", event.sport, tier)
                    }
                    Some(_) => "incomplete quota hints".to_string(),
                };
                Err(CoachingError::QuotaResolution {
                    payment_reference: event.payment_reference.clone(),
                    reason,
                })
            }
        }
    }

    async fn already_issued(&self, entitlement: Entitlement) -> IssueOutcome {
        tracing::debug!(
            target: "coachline::issuer",
            payment_reference = %entitlement.payment_reference,
            entitlement_id = %entitlement.id,
            "Payment already issued"
        );
        self.audit
            .log(CoachingAuditEvent::EntitlementAlreadyIssued {
                payment_reference: entitlement.payment_reference.clone(),
                entitlement_id: entitlement.id.clone(),
            })
            .await;
        IssueOutcome::AlreadyIssued { entitlement }
    }

    async fn link_conversation(
        &self,
        entitlement: &Entitlement,
    ) -> (Option<Conversation>, Option<CoachingError>) {
        if self.is_placeholder_player(&entitlement.player_id) {
            tracing::debug!(
                target: "coachline::issuer",
                payment_reference = %entitlement.payment_reference,
                "Placeholder player, no conversation"
            );
            return (None, None);
        }

        match self
            .conversations
            .upsert_conversation(
                &entitlement.player_id,
                &entitlement.provider_id,
                &entitlement.sport,
                &entitlement.id,
            )
            .await
        {
            Ok(conversation) => (Some(conversation), None),
            Err(e) => {
                tracing::error!(
                    target: "coachline::issuer",
                    entitlement_id = %entitlement.id,
                    player_id = %entitlement.player_id,
                    provider_id = %entitlement.provider_id,
                    error = %e,
                    "Conversation upsert failed"
                );
                (None, Some(e))
            }
        }
    }

    async fn route(&self, entitlement: &Entitlement, event: &PaymentEvent) -> RoutingStatus {
        match self.router.route(entitlement, event).await {
            Ok(record) => {
                self.audit
                    .log(CoachingAuditEvent::TransferRecorded {
                        payment_reference: record.payment_reference.clone(),
                        provider_id: record.provider_id.clone(),
                        net_amount: record.net_amount,
                        status: record.status.as_str().to_string(),
                    })
                    .await;
                RoutingStatus::Routed(record)
            }
            Err(e) => {
                self.audit
                    .log(CoachingAuditEvent::RoutingFailed {
                        payment_reference: entitlement.payment_reference.clone(),
                        provider_id: entitlement.provider_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                RoutingStatus::Failed(e)
            }
        }
    }
}
