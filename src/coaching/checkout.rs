//! Package checkout.
//!
//! Creates the processor charge for a package purchase. Everything the
//! issuer needs later (package coordinates, participants, routing mode) is
//! written into charge metadata, because the payment may be confirmed by a
//! webhook long after the checkout request is gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::accounts::CoachAccountResolver;
use super::audit::{CoachingAuditEvent, NoOpAuditLogger, SharedAuditLogger};
use super::catalog::{PackageCatalog, Tier};
use super::error::{CoachingError, CoachingResult};
use super::fees::{compute_fee, FeePercent};
use super::issuer::metadata_keys;
use super::processor::{with_timeout, CreateChargeRequest, PaymentProcessor};
use super::router::RoutingMode;
use super::storage::LedgerStore;

/// Request to buy a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub player_id: String,
    #[serde(default)]
    pub player_name: Option<String>,
    pub provider_id: String,
    pub sport: String,
    pub tier: Tier,
    #[serde(default = "default_routing_mode")]
    pub routing_mode: RoutingMode,
    #[serde(default)]
    pub customer_ref: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_routing_mode() -> RoutingMode {
    RoutingMode::Destination
}

/// A created charge awaiting payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    pub charge_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub platform_fee: i64,
    pub routing_mode: RoutingMode,
}

/// Creates charges for package purchases.
pub struct CheckoutManager<S: LedgerStore, P: PaymentProcessor> {
    processor: P,
    catalog: Arc<PackageCatalog>,
    accounts: CoachAccountResolver<S, P>,
    fee: FeePercent,
    currency: String,
    processor_timeout: Duration,
    audit: SharedAuditLogger,
}

impl<S, P> CheckoutManager<S, P>
where
    S: LedgerStore,
    P: PaymentProcessor,
{
    /// Create a new checkout manager.
    #[must_use]
    pub fn new(
        processor: P,
        catalog: Arc<PackageCatalog>,
        accounts: CoachAccountResolver<S, P>,
        fee: FeePercent,
        currency: impl Into<String>,
        processor_timeout: Duration,
    ) -> Self {
        Self {
            processor,
            catalog,
            accounts,
            fee,
            currency: currency.into().to_ascii_lowercase(),
            processor_timeout,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Set the audit logger.
    #[must_use]
    pub fn with_audit(mut self, audit: SharedAuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Create the charge for a package.
    ///
    /// Destination mode requires the provider to have a connected account
    /// up front, since the processor settles to it directly.
    pub async fn create_checkout(&self, request: CheckoutRequest) -> CoachingResult<CheckoutSession> {
        if request.provider_id.trim().is_empty() {
            return Err(CoachingError::invalid("provider_id", "must not be empty"));
        }

        let package = self.catalog.resolve(&request.sport, request.tier)?;
        let split = compute_fee(package.price, self.fee)?;

        let destination_account = match request.routing_mode {
            RoutingMode::Destination => {
                let account = self.accounts.resolve(&request.provider_id).await?;
                account.usable_account_ref().map(String::from)
            }
            RoutingMode::SeparateTransfer => None,
        };

        let mut metadata = HashMap::new();
        metadata.insert(metadata_keys::PROVIDER_ID.to_string(), request.provider_id.clone());
        metadata.insert(metadata_keys::PLAYER_ID.to_string(), request.player_id.clone());
        metadata.insert(metadata_keys::SPORT.to_string(), package.sport.clone());
        metadata.insert(metadata_keys::TIER.to_string(), package.tier.to_string());
        metadata.insert(metadata_keys::CLIPS.to_string(), package.clip_allowance.to_string());
        metadata.insert(
            metadata_keys::VALIDITY_DAYS.to_string(),
            package.validity_days.to_string(),
        );
        metadata.insert(
            metadata_keys::ROUTING_MODE.to_string(),
            request.routing_mode.to_string(),
        );
        if let Some(name) = &request.player_name {
            metadata.insert(metadata_keys::PLAYER_NAME.to_string(), name.clone());
        }
        if let Some(account_ref) = &destination_account {
            metadata.insert(metadata_keys::DESTINATION_ACCOUNT.to_string(), account_ref.clone());
        }

        let application_fee = destination_account.as_ref().map(|_| split.platform_fee);
        let charge = with_timeout(
            "create_charge",
            self.processor_timeout,
            self.processor.create_charge(CreateChargeRequest {
                amount: package.price,
                currency: self.currency.clone(),
                customer_ref: request.customer_ref.clone(),
                destination_account,
                application_fee,
                metadata,
                idempotency_key: request.idempotency_key.clone(),
            }),
        )
        .await?;

        tracing::info!(
            target: "coachline::checkout",
            charge_id = %charge.id,
            provider_id = %request.provider_id,
            sport = %package.sport,
            tier = %package.tier,
            amount = package.price,
            routing_mode = request.routing_mode.as_str(),
            "Checkout created"
        );
        self.audit
            .log(CoachingAuditEvent::CheckoutCreated {
                charge_id: charge.id.clone(),
                provider_id: request.provider_id.clone(),
                sport: package.sport.clone(),
                tier: package.tier.to_string(),
                amount: package.price,
            })
            .await;

        Ok(CheckoutSession {
            charge_id: charge.id,
            client_secret: charge.client_secret,
            amount: package.price,
            currency: self.currency.clone(),
            platform_fee: split.platform_fee,
            routing_mode: request.routing_mode,
        })
    }
}
