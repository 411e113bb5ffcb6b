//! Transfer reconciliation.
//!
//! The ledger and the processor each hold a partial view of what a provider
//! has been paid. The ledger knows about every routing attempt; the
//! processor knows about charges that settled to the connected account even
//! if the ledger missed them. Reports merge both:
//!
//! 1. ledger rows for the provider's account
//! 2. processor charges for the same account
//! 3. dedup by payment reference, else transfer/charge id, else row id;
//!    ledger rows go first so they win ties
//! 4. drop processor charges that never completed
//! 5. newest first
//!
//! A processor failure degrades the report to ledger-only and flags it
//! `partial`.

use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;

use super::accounts::CoachAccountResolver;
use super::error::CoachingResult;
use super::fees::{compute_fee, FeePercent};
use super::processor::{with_timeout, ChargeRecord, ChargeStatus, PaymentProcessor};
use super::router::RoutingMode;
use super::storage::{LedgerStore, TransferRecord, TransferSource, TransferStatus};

/// Number of processor charges read per report.
pub const PROCESSOR_FETCH_LIMIT: usize = 100;

/// Totals over a provider's merged transfer set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    /// Sum of net amounts on paid records.
    pub total_paid: i64,
    /// Sum of net amounts on pending records.
    pub total_pending: i64,
    pub unique_customers: usize,
    /// Records in the merged set, before any limit.
    pub record_count: usize,
}

/// A provider's transfer history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderTransferReport {
    pub records: Vec<TransferRecord>,
    pub summary: TransferSummary,
    /// The processor could not be read; records are ledger-only.
    pub partial: bool,
}

/// Merges ledger and processor transfer views.
pub struct Reconciler<S: LedgerStore, P: PaymentProcessor> {
    store: S,
    processor: P,
    accounts: CoachAccountResolver<S, P>,
    fee: FeePercent,
    processor_timeout: Duration,
}

impl<S, P> Reconciler<S, P>
where
    S: LedgerStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Create a new reconciler.
    #[must_use]
    pub fn new(
        store: S,
        processor: P,
        accounts: CoachAccountResolver<S, P>,
        fee: FeePercent,
        processor_timeout: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            accounts,
            fee,
            processor_timeout,
        }
    }

    /// A provider's merged transfer history, newest first.
    ///
    /// `limit` truncates the records; the summary always covers the full set.
    pub async fn list_provider_transfers(
        &self,
        provider_id: &str,
        limit: Option<usize>,
    ) -> CoachingResult<ProviderTransferReport> {
        let Some(account_ref) = self.accounts.account_ref(provider_id).await? else {
            tracing::debug!(
                target: "coachline::reconcile",
                provider_id = %provider_id,
                "Provider has no connected account"
            );
            return Ok(ProviderTransferReport::default());
        };

        let (local, remote) = futures::join!(
            self.store.list_transfers_for_account(&account_ref),
            with_timeout(
                "list_charges",
                self.processor_timeout,
                self.processor
                    .list_charges_for_account(&account_ref, PROCESSOR_FETCH_LIMIT),
            )
        );
        let local = local?;

        let (remote, partial) = match remote {
            Ok(charges) => (charges, false),
            Err(e) => {
                tracing::warn!(
                    target: "coachline::reconcile",
                    provider_id = %provider_id,
                    account_ref = %account_ref,
                    error = %e,
                    "Processor unavailable, reporting ledger rows only"
                );
                (Vec::new(), true)
            }
        };

        let mut records = self.merge(provider_id, &account_ref, local, remote);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let summary = self.summarize(provider_id, &records).await?;

        if let Some(limit) = limit {
            records.truncate(limit);
        }

        tracing::debug!(
            target: "coachline::reconcile",
            provider_id = %provider_id,
            record_count = summary.record_count,
            partial = partial,
            "Provider transfers reconciled"
        );

        Ok(ProviderTransferReport {
            records,
            summary,
            partial,
        })
    }

    fn merge(
        &self,
        provider_id: &str,
        account_ref: &str,
        local: Vec<TransferRecord>,
        remote: Vec<ChargeRecord>,
    ) -> Vec<TransferRecord> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged = Vec::with_capacity(local.len() + remote.len());

        for record in local {
            if claim(&mut seen, ledger_keys(&record)) {
                merged.push(record);
            }
        }

        for charge in remote {
            if charge.status.never_completed() {
                continue;
            }
            if claim(&mut seen, charge_keys(&charge)) {
                merged.push(self.record_from_charge(provider_id, account_ref, charge));
            }
        }

        merged
    }

    fn record_from_charge(
        &self,
        provider_id: &str,
        account_ref: &str,
        charge: ChargeRecord,
    ) -> TransferRecord {
        let platform_fee = charge.application_fee.unwrap_or_else(|| {
            compute_fee(charge.amount, self.fee)
                .map(|split| split.platform_fee)
                .unwrap_or(0)
        });
        let status = match charge.status {
            ChargeStatus::Succeeded => TransferStatus::Paid,
            ChargeStatus::Pending | ChargeStatus::Processing => TransferStatus::Pending,
            _ => TransferStatus::Failed,
        };

        TransferRecord {
            id: charge.id.clone(),
            payment_reference: charge_payment_reference(&charge).unwrap_or_else(|| charge.id.clone()),
            provider_id: provider_id.to_string(),
            provider_account_ref: account_ref.to_string(),
            charge_id: Some(charge.id),
            processor_transfer_id: charge.transfer_id,
            gross_amount: charge.amount,
            platform_fee,
            net_amount: charge.amount - platform_fee,
            currency: charge.currency,
            status,
            source: TransferSource::Processor,
            routing_mode: RoutingMode::Destination,
            customer_ref: charge.customer_ref,
            failure_reason: None,
            created_at: charge.created_at,
        }
    }

    async fn summarize(
        &self,
        provider_id: &str,
        records: &[TransferRecord],
    ) -> CoachingResult<TransferSummary> {
        let mut summary = TransferSummary {
            record_count: records.len(),
            ..TransferSummary::default()
        };

        for record in records {
            match record.status {
                TransferStatus::Paid => summary.total_paid += record.net_amount,
                TransferStatus::Pending => summary.total_pending += record.net_amount,
                TransferStatus::Failed => {}
            }
        }

        let conversations = self.store.list_conversations_for_provider(provider_id).await?;
        summary.unique_customers = if conversations.is_empty() {
            records
                .iter()
                .filter(|r| r.status == TransferStatus::Paid)
                .filter_map(|r| r.customer_ref.as_deref())
                .collect::<HashSet<_>>()
                .len()
        } else {
            conversations
                .iter()
                .map(|c| c.player_id.as_str())
                .collect::<HashSet<_>>()
                .len()
        };

        Ok(summary)
    }
}

/// Insert every key; returns false if any was already present.
fn claim(seen: &mut HashSet<String>, keys: Vec<String>) -> bool {
    let duplicate = keys.iter().any(|k| seen.contains(k));
    seen.extend(keys);
    !duplicate
}

fn ledger_keys(record: &TransferRecord) -> Vec<String> {
    let mut keys: Vec<String> = [
        Some(record.payment_reference.as_str()),
        record.processor_transfer_id.as_deref(),
        record.charge_id.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|k| !k.is_empty())
    .map(String::from)
    .collect();

    if keys.is_empty() {
        keys.push(format!("local:{}", record.id));
    }
    keys
}

fn charge_keys(charge: &ChargeRecord) -> Vec<String> {
    [
        charge_payment_reference(charge),
        charge.transfer_id.clone(),
        Some(charge.id.clone()),
    ]
    .into_iter()
    .flatten()
    .filter(|k| !k.is_empty())
    .collect()
}

fn charge_payment_reference(charge: &ChargeRecord) -> Option<String> {
    charge
        .payment_reference
        .clone()
        .or_else(|| {
            charge
                .metadata
                .get(super::issuer::metadata_keys::PAYMENT_REFERENCE)
                .cloned()
        })
        .filter(|r| !r.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::coaching::processor::MockPaymentProcessor;
    use crate::coaching::storage::{
        CoachAccount, Conversation, ConversationStatus, InMemoryLedgerStore, UnreadCounts,
    };
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn reconciler(
        store: &InMemoryLedgerStore,
        processor: &MockPaymentProcessor,
    ) -> Reconciler<InMemoryLedgerStore, MockPaymentProcessor> {
        let timeout = Duration::from_millis(200);
        let accounts = CoachAccountResolver::new(
            store.clone(),
            processor.clone(),
            Arc::new(SystemClock),
            timeout,
        );
        Reconciler::new(
            store.clone(),
            processor.clone(),
            accounts,
            FeePercent::from_percent(15).unwrap(),
            timeout,
        )
    }

    async fn link(store: &InMemoryLedgerStore) {
        store
            .save_coach_account(&CoachAccount {
                provider_id: "coach_1".to_string(),
                processor_account_ref: Some("acct_1".to_string()),
                charges_enabled: true,
                payouts_enabled: true,
                details_submitted: true,
                updated_at: base_time(),
            })
            .await
            .unwrap();
    }

    fn ledger_row(payment_reference: &str, status: TransferStatus, offset_min: i64) -> TransferRecord {
        TransferRecord {
            id: format!("tr_row_{}", payment_reference),
            payment_reference: payment_reference.to_string(),
            provider_id: "coach_1".to_string(),
            provider_account_ref: "acct_1".to_string(),
            charge_id: Some(format!("ch_{}", payment_reference)),
            processor_transfer_id: None,
            gross_amount: 4725,
            platform_fee: 709,
            net_amount: 4016,
            currency: "usd".to_string(),
            status,
            source: TransferSource::Ledger,
            routing_mode: RoutingMode::Destination,
            customer_ref: Some("cus_1".to_string()),
            failure_reason: None,
            created_at: base_time() + ChronoDuration::minutes(offset_min),
        }
    }

    fn charge(id: &str, payment_reference: Option<&str>, status: ChargeStatus, offset_min: i64) -> ChargeRecord {
        ChargeRecord {
            id: id.to_string(),
            payment_reference: payment_reference.map(String::from),
            amount: 6075,
            currency: "usd".to_string(),
            status,
            application_fee: Some(911),
            destination_account: Some("acct_1".to_string()),
            customer_ref: Some("cus_2".to_string()),
            transfer_id: None,
            metadata: HashMap::new(),
            created_at: base_time() + ChronoDuration::minutes(offset_min),
            client_secret: None,
        }
    }

    #[tokio::test]
    async fn test_ledger_wins_over_processor_row() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        link(&store).await;
        store
            .insert_transfer(&ledger_row("pi_1", TransferStatus::Paid, 0))
            .await
            .unwrap();
        processor.add_charge(charge("ch_x", Some("pi_1"), ChargeStatus::Succeeded, 5));

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", None)
            .await
            .unwrap();

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].source, TransferSource::Ledger);
        assert_eq!(report.summary.total_paid, 4016);
        assert!(!report.partial);
    }

    #[tokio::test]
    async fn test_processor_only_rows_are_included() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        link(&store).await;
        store
            .insert_transfer(&ledger_row("pi_1", TransferStatus::Paid, 0))
            .await
            .unwrap();
        processor.add_charge(charge("pi_2", None, ChargeStatus::Processing, 10));
        processor.add_charge(charge("pi_3", None, ChargeStatus::RequiresPaymentMethod, 20));

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", None)
            .await
            .unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].payment_reference, "pi_2");
        assert_eq!(report.records[0].source, TransferSource::Processor);
        assert_eq!(report.records[0].status, TransferStatus::Pending);
        assert_eq!(report.summary.total_pending, 6075 - 911);
        assert_eq!(report.summary.total_paid, 4016);
    }

    #[tokio::test]
    async fn test_processor_failure_degrades_to_ledger() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        processor.fail_listing(true);
        link(&store).await;
        store
            .insert_transfer(&ledger_row("pi_1", TransferStatus::Paid, 0))
            .await
            .unwrap();

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", None)
            .await
            .unwrap();

        assert!(report.partial);
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn test_limit_applies_after_sort() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        link(&store).await;
        for (i, reference) in ["pi_1", "pi_2", "pi_3"].iter().enumerate() {
            store
                .insert_transfer(&ledger_row(reference, TransferStatus::Paid, i as i64))
                .await
                .unwrap();
        }

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", Some(2))
            .await
            .unwrap();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].payment_reference, "pi_3");
        assert_eq!(report.summary.record_count, 3);
        assert_eq!(report.summary.total_paid, 3 * 4016);
    }

    #[tokio::test]
    async fn test_unique_customers_prefers_conversations() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();
        link(&store).await;
        store
            .insert_transfer(&ledger_row("pi_1", TransferStatus::Paid, 0))
            .await
            .unwrap();
        processor.add_charge(charge("pi_2", None, ChargeStatus::Succeeded, 1));

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", None)
            .await
            .unwrap();
        // cus_1 and cus_2 from paid records
        assert_eq!(report.summary.unique_customers, 2);

        for player in ["player_a", "player_b", "player_c"] {
            store
                .upsert_active_conversation(&Conversation {
                    id: format!("conv_{}", player),
                    player_id: player.to_string(),
                    provider_id: "coach_1".to_string(),
                    sport: "golf".to_string(),
                    linked_entitlement_id: "ent".to_string(),
                    expiry_anchor_at: base_time(),
                    created_at: base_time(),
                    last_activity_at: base_time(),
                    unread_counts: UnreadCounts::default(),
                    status: ConversationStatus::Active,
                })
                .await
                .unwrap();
        }

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", None)
            .await
            .unwrap();
        assert_eq!(report.summary.unique_customers, 3);
    }

    #[tokio::test]
    async fn test_provider_without_account_gets_empty_report() {
        let store = InMemoryLedgerStore::new();
        let processor = MockPaymentProcessor::new();

        let report = reconciler(&store, &processor)
            .list_provider_transfers("coach_1", None)
            .await
            .unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.summary, TransferSummary::default());
    }
}
