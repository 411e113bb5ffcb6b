//! Connected account resolution.
//!
//! Maps a provider to the processor sub-account that receives their share of
//! each payment. Absence of a usable account reference is a hard routing
//! failure; it never falls back to the platform account.

use std::time::Duration;

use super::error::{CoachingError, CoachingResult};
use super::processor::{with_timeout, AccountStatus, PaymentProcessor};
use super::storage::{CoachAccount, LedgerStore};
use crate::clock::SharedClock;

/// Resolves and maintains provider connected accounts.
pub struct CoachAccountResolver<S: LedgerStore, P: PaymentProcessor> {
    store: S,
    processor: P,
    clock: SharedClock,
    processor_timeout: Duration,
}

impl<S: LedgerStore, P: PaymentProcessor> CoachAccountResolver<S, P> {
    /// Create a new resolver.
    #[must_use]
    pub fn new(store: S, processor: P, clock: SharedClock, processor_timeout: Duration) -> Self {
        Self {
            store,
            processor,
            clock,
            processor_timeout,
        }
    }

    /// The provider's connected account, failing with
    /// [`CoachingError::RoutingUnavailable`] if it has no usable reference.
    pub async fn resolve(&self, provider_id: &str) -> CoachingResult<CoachAccount> {
        let account = self
            .store
            .get_coach_account(provider_id)
            .await?
            .ok_or_else(|| CoachingError::RoutingUnavailable {
                provider_id: provider_id.to_string(),
                reason: "no connected account".to_string(),
            })?;

        if account.usable_account_ref().is_none() {
            return Err(CoachingError::RoutingUnavailable {
                provider_id: provider_id.to_string(),
                reason: "connected account reference is empty".to_string(),
            });
        }

        Ok(account)
    }

    /// The provider's account reference, or `None` if they have not connected one.
    pub async fn account_ref(&self, provider_id: &str) -> CoachingResult<Option<String>> {
        Ok(self
            .store
            .get_coach_account(provider_id)
            .await?
            .and_then(|a| a.usable_account_ref().map(String::from)))
    }

    /// Link a processor account to a provider and pull its current status.
    pub async fn link_account(
        &self,
        provider_id: &str,
        account_ref: &str,
    ) -> CoachingResult<CoachAccount> {
        let account_ref = account_ref.trim();
        if account_ref.is_empty() {
            return Err(CoachingError::invalid("account_ref", "must not be empty"));
        }

        let status = with_timeout(
            "retrieve_account",
            self.processor_timeout,
            self.processor.retrieve_account(account_ref),
        )
        .await?;

        let account = self.account_from_status(provider_id, &status);
        self.store.save_coach_account(&account).await?;

        tracing::info!(
            target: "coachline::accounts",
            provider_id = %provider_id,
            account_ref = %account_ref,
            charges_enabled = account.charges_enabled,
            payouts_enabled = account.payouts_enabled,
            "Connected account linked"
        );

        Ok(account)
    }

    /// Re-read a provider's account status from the processor.
    pub async fn refresh(&self, provider_id: &str) -> CoachingResult<CoachAccount> {
        let account = self.resolve(provider_id).await?;
        let account_ref = account.usable_account_ref().unwrap_or_default().to_string();

        let status = with_timeout(
            "retrieve_account",
            self.processor_timeout,
            self.processor.retrieve_account(&account_ref),
        )
        .await?;

        let refreshed = self.account_from_status(provider_id, &status);
        self.store.save_coach_account(&refreshed).await?;
        Ok(refreshed)
    }

    /// Apply an `account.updated` notification. Returns `None` when the
    /// account is not linked to any provider.
    pub async fn apply_account_update(
        &self,
        status: &AccountStatus,
    ) -> CoachingResult<Option<CoachAccount>> {
        let Some(existing) = self
            .store
            .find_coach_account_by_ref(&status.account_ref)
            .await?
        else {
            tracing::debug!(
                target: "coachline::accounts",
                account_ref = %status.account_ref,
                "Account update for unlinked account"
            );
            return Ok(None);
        };

        let updated = self.account_from_status(&existing.provider_id, status);
        self.store.save_coach_account(&updated).await?;
        Ok(Some(updated))
    }

    fn account_from_status(&self, provider_id: &str, status: &AccountStatus) -> CoachAccount {
        CoachAccount {
            provider_id: provider_id.to_string(),
            processor_account_ref: Some(status.account_ref.clone()),
            charges_enabled: status.charges_enabled,
            payouts_enabled: status.payouts_enabled,
            details_submitted: status.details_submitted,
            updated_at: self.clock.now(),
        }
    }
}
