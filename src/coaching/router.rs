//! Fund routing.
//!
//! Moves the provider's share of a payment to their connected account and
//! records the attempt. The mode is chosen at checkout and read back from
//! charge metadata:
//!
//! - **Destination**: the processor already settled `gross - application_fee`
//!   to the connected account. The router only records a paid ledger row.
//! - **Separate transfer**: the platform holds the gross amount. The router
//!   resolves the provider's account and transfers `net_amount`, referencing
//!   the original charge.
//!
//! Failures are recorded and surfaced, never retried automatically.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::accounts::CoachAccountResolver;
use super::error::{CoachingError, CoachingResult};
use super::fees::{compute_fee, FeePercent, FeeSplit};
use super::issuer::PaymentEvent;
use super::processor::{with_timeout, CreateTransferRequest, PaymentProcessor};
use super::storage::{
    Entitlement, LedgerStore, TransferRecord, TransferSource, TransferStatus,
};
use crate::clock::SharedClock;

/// How funds reach the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// The processor settles directly to the connected account.
    Destination,
    /// The platform collects, then transfers the provider's net share.
    SeparateTransfer,
}

impl RoutingMode {
    /// Parse a metadata value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "destination" | "destination_charge" => Some(Self::Destination),
            "separate_transfer" | "separate" | "transfer" => Some(Self::SeparateTransfer),
            _ => None,
        }
    }

    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Destination => "destination",
            Self::SeparateTransfer => "separate_transfer",
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Idempotency key for the transfer of a payment.
#[must_use]
pub fn transfer_idempotency_key(payment_reference: &str) -> String {
    format!("transfer:{}", payment_reference)
}

/// Routes funds for issued entitlements.
pub struct FundRouter<S: LedgerStore, P: PaymentProcessor> {
    store: S,
    processor: P,
    accounts: CoachAccountResolver<S, P>,
    fee: FeePercent,
    clock: SharedClock,
    processor_timeout: Duration,
}

impl<S, P> FundRouter<S, P>
where
    S: LedgerStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Create a new fund router.
    #[must_use]
    pub fn new(
        store: S,
        processor: P,
        fee: FeePercent,
        clock: SharedClock,
        processor_timeout: Duration,
    ) -> Self {
        let accounts = CoachAccountResolver::new(
            store.clone(),
            processor.clone(),
            clock.clone(),
            processor_timeout,
        );
        Self {
            store,
            processor,
            accounts,
            fee,
            clock,
            processor_timeout,
        }
    }

    /// The platform fee rate.
    #[must_use]
    pub fn fee(&self) -> FeePercent {
        self.fee
    }

    /// Route funds for a durably written entitlement.
    ///
    /// If a transfer row already exists for the payment it is returned as is.
    pub async fn route(
        &self,
        entitlement: &Entitlement,
        event: &PaymentEvent,
    ) -> CoachingResult<TransferRecord> {
        if let Some(existing) = self
            .store
            .get_transfer_by_payment(&entitlement.payment_reference)
            .await?
        {
            tracing::debug!(
                target: "coachline::router",
                payment_reference = %entitlement.payment_reference,
                status = existing.status.as_str(),
                "Transfer already recorded for payment"
            );
            return Ok(existing);
        }

        let split = compute_fee(entitlement.gross_amount, self.fee)?;

        match event.routing_mode {
            RoutingMode::Destination => self.record_destination(entitlement, event, split).await,
            RoutingMode::SeparateTransfer => self.transfer(entitlement, event, split).await,
        }
    }

    async fn record_destination(
        &self,
        entitlement: &Entitlement,
        event: &PaymentEvent,
        split: FeeSplit,
    ) -> CoachingResult<TransferRecord> {
        let account_ref = match event
            .destination_account
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
        {
            Some(account_ref) => account_ref.to_string(),
            None => self.linked_account_ref(&entitlement.provider_id).await?,
        };

        let record = self.new_record(
            entitlement,
            event,
            split,
            account_ref,
            RoutingMode::Destination,
            TransferStatus::Paid,
        );
        self.store.insert_transfer(&record).await?;

        tracing::info!(
            target: "coachline::router",
            payment_reference = %record.payment_reference,
            provider_id = %record.provider_id,
            net_amount = record.net_amount,
            platform_fee = record.platform_fee,
            "Destination charge recorded"
        );

        Ok(record)
    }

    async fn transfer(
        &self,
        entitlement: &Entitlement,
        event: &PaymentEvent,
        split: FeeSplit,
    ) -> CoachingResult<TransferRecord> {
        let account = self.accounts.resolve(&entitlement.provider_id).await.map_err(|e| {
            tracing::error!(
                target: "coachline::router",
                payment_reference = %entitlement.payment_reference,
                provider_id = %entitlement.provider_id,
                error = %e,
                "No connected account for transfer"
            );
            e
        })?;
        let account_ref = account.usable_account_ref().unwrap_or_default().to_string();

        let mut metadata = HashMap::new();
        metadata.insert("payment_reference".to_string(), entitlement.payment_reference.clone());
        metadata.insert("provider_id".to_string(), entitlement.provider_id.clone());
        metadata.insert("entitlement_id".to_string(), entitlement.id.clone());

        let request = CreateTransferRequest {
            amount: split.net_amount,
            currency: entitlement.currency.clone(),
            destination_account: account_ref.clone(),
            source_charge_id: event.charge_id.clone(),
            transfer_group: entitlement.payment_reference.clone(),
            idempotency_key: transfer_idempotency_key(&entitlement.payment_reference),
            metadata,
        };

        let result = with_timeout(
            "create_transfer",
            self.processor_timeout,
            self.processor.create_transfer(request),
        )
        .await;

        match result {
            Ok(transfer) => {
                let mut record = self.new_record(
                    entitlement,
                    event,
                    split,
                    account_ref,
                    RoutingMode::SeparateTransfer,
                    TransferStatus::from_processor(&transfer.status),
                );
                record.processor_transfer_id = Some(transfer.id);
                self.store.insert_transfer(&record).await?;

                tracing::info!(
                    target: "coachline::router",
                    payment_reference = %record.payment_reference,
                    provider_id = %record.provider_id,
                    transfer_id = record.processor_transfer_id.as_deref().unwrap_or_default(),
                    net_amount = record.net_amount,
                    status = record.status.as_str(),
                    "Transfer created"
                );

                Ok(record)
            }
            Err(e) => {
                let mut record = self.new_record(
                    entitlement,
                    event,
                    split,
                    account_ref,
                    RoutingMode::SeparateTransfer,
                    TransferStatus::Failed,
                );
                record.failure_reason = Some(e.to_string());

                if let Err(store_err) = self.store.insert_transfer(&record).await {
                    tracing::error!(
                        target: "coachline::router",
                        payment_reference = %record.payment_reference,
                        error = %store_err,
                        "Failed to record failed transfer"
                    );
                }

                tracing::error!(
                    target: "coachline::router",
                    payment_reference = %record.payment_reference,
                    provider_id = %record.provider_id,
                    net_amount = record.net_amount,
                    error = %e,
                    "Transfer failed, manual reconciliation required"
                );

                Err(CoachingError::TransferFailed {
                    payment_reference: entitlement.payment_reference.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn linked_account_ref(&self, provider_id: &str) -> CoachingResult<String> {
        self.accounts
            .account_ref(provider_id)
            .await?
            .ok_or_else(|| CoachingError::RoutingUnavailable {
                provider_id: provider_id.to_string(),
                reason: "destination charge without a connected account".to_string(),
            })
    }

    fn new_record(
        &self,
        entitlement: &Entitlement,
        event: &PaymentEvent,
        split: FeeSplit,
        account_ref: String,
        routing_mode: RoutingMode,
        status: TransferStatus,
    ) -> TransferRecord {
        TransferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            payment_reference: entitlement.payment_reference.clone(),
            provider_id: entitlement.provider_id.clone(),
            provider_account_ref: account_ref,
            charge_id: event.charge_id.clone(),
            processor_transfer_id: None,
            gross_amount: split.gross,
            platform_fee: split.platform_fee,
            net_amount: split.net_amount,
            currency: entitlement.currency.clone(),
            status,
            source: TransferSource::Ledger,
            routing_mode,
            customer_ref: event.customer_ref.clone(),
            failure_reason: None,
            created_at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::coaching::catalog::Tier;
    use crate::coaching::processor::MockPaymentProcessor;
    use crate::coaching::storage::{CoachAccount, EntitlementStatus, InMemoryLedgerStore};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;

    fn router(
        store: &InMemoryLedgerStore,
        processor: &MockPaymentProcessor,
    ) -> FundRouter<InMemoryLedgerStore, MockPaymentProcessor> {
        FundRouter::new(
            store.clone(),
            processor.clone(),
            FeePercent::from_percent(15).unwrap(),
            Arc::new(SystemClock),
            Duration::from_millis(100),
        )
    }

    fn entitlement() -> Entitlement {
        let now = Utc::now();
        Entitlement {
            id: "ent_1".to_string(),
            payment_reference: "pi_1".to_string(),
            provider_id: "coach_1".to_string(),
            player_id: "player_1".to_string(),
            sport: "golf".to_string(),
            tier: Some(Tier::One),
            gross_amount: 4725,
            currency: "usd".to_string(),
            clip_allowance: 3,
            clips_consumed: 0,
            created_at: now,
            expires_at: now + ChronoDuration::days(3),
            status: EntitlementStatus::Active,
        }
    }

    fn event(mode: RoutingMode) -> PaymentEvent {
        PaymentEvent {
            payment_reference: "pi_1".to_string(),
            charge_id: Some("ch_1".to_string()),
            provider_id: "coach_1".to_string(),
            player_id: "player_1".to_string(),
            player_name: None,
            sport: "golf".to_string(),
            tier: Some(Tier::One),
            gross_amount: 4725,
            currency: "usd".to_string(),
            clip_allowance_hint: None,
            validity_days_hint: None,
            routing_mode: mode,
            destination_account: None,
            customer_ref: Some("cus_1".to_string()),
        }
    }

    async fn link(store: &InMemoryLedgerStore) {
        store
            .save_coach_account(&CoachAccount {
                provider_id: "coach_1".to_string(),
                processor_account_ref: Some("acct_1".to_string()),
                charges_enabled: true,
                payouts_enabled: true,
                details_submitted: true,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!(RoutingMode::parse("destination"), Some(RoutingMode::Destination));
        assert_eq!(
            RoutingMode::parse("Separate_Transfer"),
            Some(RoutingMode::SeparateTransfer)
        );
        assert_eq!(RoutingMode::parse("wire"), None);
    }

    #[tokio::test]
    async fn test_separate_transfer_sends_net_amount() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        link(&store).await;

        let record = router(&store, &processor)
            .route(&entitlement(), &event(RoutingMode::SeparateTransfer))
            .await
            .unwrap();

        assert_eq!(record.status, TransferStatus::Paid);
        assert_eq!(record.platform_fee, 709);
        assert_eq!(record.net_amount, 4016);

        let transfers = processor.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, 4016);
        assert_eq!(transfers[0].destination_account, "acct_1");
        assert_eq!(transfers[0].source_charge_id.as_deref(), Some("ch_1"));
        assert_eq!(transfers[0].idempotency_key, "transfer:pi_1");
    }

    #[tokio::test]
    async fn test_destination_mode_records_without_transfer_call() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        let mut event = event(RoutingMode::Destination);
        event.destination_account = Some("acct_9".to_string());

        let record = router(&store, &processor)
            .route(&entitlement(), &event)
            .await
            .unwrap();

        assert_eq!(record.status, TransferStatus::Paid);
        assert_eq!(record.source, TransferSource::Ledger);
        assert_eq!(record.provider_account_ref, "acct_9");
        assert!(processor.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_missing_account_is_routing_unavailable() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();

        let err = router(&store, &processor)
            .route(&entitlement(), &event(RoutingMode::SeparateTransfer))
            .await
            .unwrap_err();

        assert!(matches!(err, CoachingError::RoutingUnavailable { .. }));
        assert!(store.transfers().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_transfer_is_recorded() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        processor.fail_transfers(true);
        link(&store).await;

        let err = router(&store, &processor)
            .route(&entitlement(), &event(RoutingMode::SeparateTransfer))
            .await
            .unwrap_err();
        assert!(matches!(err, CoachingError::TransferFailed { .. }));

        let transfers = store.transfers().await;
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].status, TransferStatus::Failed);
        assert!(transfers[0].failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_timed_out_transfer_is_failed() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        processor.set_delay(std::time::Duration::from_secs(1));
        link(&store).await;

        let err = router(&store, &processor)
            .route(&entitlement(), &event(RoutingMode::SeparateTransfer))
            .await
            .unwrap_err();
        assert!(matches!(err, CoachingError::TransferFailed { .. }));
        assert_eq!(store.transfers().await[0].status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_route_is_idempotent_per_payment() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        link(&store).await;
        let router = router(&store, &processor);

        let first = router
            .route(&entitlement(), &event(RoutingMode::SeparateTransfer))
            .await
            .unwrap();
        let second = router
            .route(&entitlement(), &event(RoutingMode::SeparateTransfer))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(processor.transfers().len(), 1);
    }
}
