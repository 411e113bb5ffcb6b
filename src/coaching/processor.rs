//! Payment processor boundary.
//!
//! The processor is a black box: the pipeline only needs to create and read
//! charges, create transfers to connected accounts, and read account status.
//! [`MockPaymentProcessor`] is a scriptable in-memory implementation for tests
//! and local development.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{CoachingError, CoachingResult};

/// Processor charge status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Succeeded,
    Pending,
    Processing,
    RequiresPaymentMethod,
    RequiresAction,
    Canceled,
    Failed,
}

impl ChargeStatus {
    /// Parse a processor status string. Unknown values are treated as pending.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "succeeded" | "paid" => Self::Succeeded,
            "processing" => Self::Processing,
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_action" | "requires_confirmation" => Self::RequiresAction,
            "canceled" | "cancelled" => Self::Canceled,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// The charge will never settle without further action from the payer.
    #[must_use]
    pub fn never_completed(&self) -> bool {
        matches!(
            self,
            Self::RequiresPaymentMethod | Self::RequiresAction | Self::Canceled | Self::Failed
        )
    }
}

/// A charge as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub id: String,
    /// The payment reference carried in charge metadata, if any.
    pub payment_reference: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: ChargeStatus,
    /// Platform fee withheld in destination mode.
    pub application_fee: Option<i64>,
    /// Connected account that receives the funds.
    pub destination_account: Option<String>,
    pub customer_ref: Option<String>,
    /// Transfer created from this charge, if any.
    pub transfer_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Secret the client uses to complete payment.
    pub client_secret: Option<String>,
}

/// Request to create a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChargeRequest {
    pub amount: i64,
    pub currency: String,
    pub customer_ref: Option<String>,
    /// Set for destination mode; the processor settles to this account.
    pub destination_account: Option<String>,
    /// Withheld by the platform in destination mode.
    pub application_fee: Option<i64>,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: Option<String>,
}

/// Request to move funds to a connected account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTransferRequest {
    pub amount: i64,
    pub currency: String,
    pub destination_account: String,
    /// Charge the funds are drawn from.
    pub source_charge_id: Option<String>,
    pub transfer_group: String,
    pub idempotency_key: String,
    pub metadata: HashMap<String, String>,
}

/// Transfer creation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub id: String,
    pub status: String,
}

/// Connected account capabilities as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatus {
    pub account_ref: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
}

/// Trait for payment processor operations.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Create a charge.
    async fn create_charge(&self, request: CreateChargeRequest) -> CoachingResult<ChargeRecord>;

    /// Read a charge by ID.
    async fn retrieve_charge(&self, charge_id: &str) -> CoachingResult<ChargeRecord>;

    /// Transfer funds to a connected account.
    async fn create_transfer(&self, request: CreateTransferRequest) -> CoachingResult<TransferResult>;

    /// Read a connected account's status.
    async fn retrieve_account(&self, account_ref: &str) -> CoachingResult<AccountStatus>;

    /// Charges routed to a connected account, newest first.
    async fn list_charges_for_account(
        &self,
        account_ref: &str,
        limit: usize,
    ) -> CoachingResult<Vec<ChargeRecord>>;
}

/// Run a processor call, failing with [`CoachingError::ProcessorTimeout`]
/// if it does not finish within `timeout`.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, call: F) -> CoachingResult<T>
where
    F: Future<Output = CoachingResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_elapsed) => {
            tracing::warn!(
                target: "coachline::processor",
                operation = operation,
                timeout_seconds = timeout.as_secs(),
                "Processor call timed out"
            );
            Err(CoachingError::ProcessorTimeout {
                operation: operation.to_string(),
                timeout_secs: timeout.as_secs(),
            })
        }
    }
}

pub use mock::MockPaymentProcessor;

/// Scriptable in-memory processor.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock processor that records calls and can be told to fail.
    #[derive(Clone, Default)]
    pub struct MockPaymentProcessor {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        counter: AtomicU64,
        fail_transfers: AtomicBool,
        fail_listing: AtomicBool,
        delay_ms: AtomicU64,
        charges: RwLock<Vec<ChargeRecord>>,
        accounts: RwLock<HashMap<String, AccountStatus>>,
        transfers: RwLock<Vec<CreateTransferRequest>>,
    }

    impl MockPaymentProcessor {
        /// Create a new mock processor.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `create_transfer` fail.
        pub fn fail_transfers(&self, fail: bool) {
            self.inner.fail_transfers.store(fail, Ordering::SeqCst);
        }

        /// Make `list_charges_for_account` fail.
        pub fn fail_listing(&self, fail: bool) {
            self.inner.fail_listing.store(fail, Ordering::SeqCst);
        }

        /// Delay every call, for exercising timeouts.
        pub fn set_delay(&self, delay: Duration) {
            let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            self.inner.delay_ms.store(ms, Ordering::SeqCst);
        }

        /// Seed a charge.
        pub fn add_charge(&self, charge: ChargeRecord) {
            write(&self.inner.charges).push(charge);
        }

        /// Move a charge to a new status, e.g. once the payer completes payment.
        pub fn set_charge_status(&self, charge_id: &str, status: ChargeStatus) {
            if let Some(charge) = write(&self.inner.charges).iter_mut().find(|c| c.id == charge_id) {
                charge.status = status;
            }
        }

        /// Seed a connected account.
        pub fn add_account(&self, status: AccountStatus) {
            write(&self.inner.accounts).insert(status.account_ref.clone(), status);
        }

        /// Transfers requested so far.
        #[must_use]
        pub fn transfers(&self) -> Vec<CreateTransferRequest> {
            read(&self.inner.transfers).clone()
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}_mock_{}", prefix, self.inner.counter.fetch_add(1, Ordering::SeqCst))
        }

        async fn maybe_delay(&self) {
            let ms = self.inner.delay_ms.load(Ordering::SeqCst);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
    }

    fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
        lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
        lock.write().unwrap_or_else(|e| e.into_inner())
    }

    fn api_error(operation: &str, message: &str) -> CoachingError {
        CoachingError::ProcessorApiError {
            operation: operation.to_string(),
            message: message.to_string(),
            code: None,
            http_status: Some(500),
        }
    }

    #[async_trait]
    impl PaymentProcessor for MockPaymentProcessor {
        async fn create_charge(&self, request: CreateChargeRequest) -> CoachingResult<ChargeRecord> {
            self.maybe_delay().await;
            let id = self.next_id("pi");
            let charge = ChargeRecord {
                client_secret: Some(format!("{}_secret", id)),
                id,
                payment_reference: None,
                amount: request.amount,
                currency: request.currency,
                status: ChargeStatus::RequiresPaymentMethod,
                application_fee: request.application_fee,
                destination_account: request.destination_account,
                customer_ref: request.customer_ref,
                transfer_id: None,
                metadata: request.metadata,
                created_at: Utc::now(),
            };
            write(&self.inner.charges).push(charge.clone());
            Ok(charge)
        }

        async fn retrieve_charge(&self, charge_id: &str) -> CoachingResult<ChargeRecord> {
            self.maybe_delay().await;
            read(&self.inner.charges)
                .iter()
                .find(|c| c.id == charge_id)
                .cloned()
                .ok_or_else(|| CoachingError::ProcessorApiError {
                    operation: "retrieve_charge".to_string(),
                    message: format!("No such charge: {}", charge_id),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                })
        }

        async fn create_transfer(&self, request: CreateTransferRequest) -> CoachingResult<TransferResult> {
            self.maybe_delay().await;
            if self.inner.fail_transfers.load(Ordering::SeqCst) {
                return Err(api_error("create_transfer", "transfer declined"));
            }
            write(&self.inner.transfers).push(request);
            Ok(TransferResult {
                id: self.next_id("tr"),
                status: "paid".to_string(),
            })
        }

        async fn retrieve_account(&self, account_ref: &str) -> CoachingResult<AccountStatus> {
            self.maybe_delay().await;
            read(&self.inner.accounts)
                .get(account_ref)
                .cloned()
                .ok_or_else(|| CoachingError::ProcessorApiError {
                    operation: "retrieve_account".to_string(),
                    message: format!("No such account: {}", account_ref),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                })
        }

        async fn list_charges_for_account(
            &self,
            account_ref: &str,
            limit: usize,
        ) -> CoachingResult<Vec<ChargeRecord>> {
            self.maybe_delay().await;
            if self.inner.fail_listing.load(Ordering::SeqCst) {
                return Err(api_error("list_charges", "service unavailable"));
            }
            let mut charges: Vec<ChargeRecord> = read(&self.inner.charges)
                .iter()
                .filter(|c| c.destination_account.as_deref() == Some(account_ref))
                .cloned()
                .collect();
            charges.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            charges.truncate(limit);
            Ok(charges)
        }
    }
}
