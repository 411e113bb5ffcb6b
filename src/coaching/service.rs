//! Service facade wiring the payment pipeline together.

use std::sync::Arc;

use secrecy::ExposeSecret;

use super::accounts::CoachAccountResolver;
use super::audit::{NoOpAuditLogger, SharedAuditLogger};
use super::catalog::PackageCatalog;
use super::checkout::{CheckoutManager, CheckoutRequest, CheckoutSession};
use super::conversation::ConversationManager;
use super::error::{CoachingError, CoachingResult};
use super::guard::{ConversationGuard, QuotaSnapshot, SendMessageRequest};
use super::issuer::{EntitlementIssuer, IssueOutcome, PaymentEvent};
use super::processor::{with_timeout, ChargeStatus, PaymentProcessor};
use super::reconcile::{ProviderTransferReport, Reconciler};
use super::router::FundRouter;
use super::storage::{CoachAccount, Conversation, LedgerStore, Message, SenderRole};
use super::webhook::{WebhookHandler, WebhookOutcome, WebhookVerifier};
use crate::clock::{SharedClock, SystemClock};
use crate::config::CoachingConfig;

/// The coaching payment pipeline.
///
/// Owns one instance of every component, all sharing the same store,
/// processor and clock.
pub struct CoachingService<S: LedgerStore, P: PaymentProcessor> {
    store: S,
    processor: P,
    config: CoachingConfig,
    clock: SharedClock,
    checkout: CheckoutManager<S, P>,
    issuer: Arc<EntitlementIssuer<S, P>>,
    accounts: Arc<CoachAccountResolver<S, P>>,
    reconciler: Reconciler<S, P>,
    guard: ConversationGuard<S>,
    conversations: ConversationManager<S>,
    webhooks: WebhookHandler<S, P>,
    verifier: WebhookVerifier,
}

/// Builder for [`CoachingService`].
#[must_use = "builder does nothing until you call build()"]
pub struct CoachingServiceBuilder<S, P> {
    store: S,
    processor: P,
    catalog: Option<PackageCatalog>,
    config: CoachingConfig,
    clock: Option<SharedClock>,
    audit: Option<SharedAuditLogger>,
}

impl<S, P> CoachingServiceBuilder<S, P>
where
    S: LedgerStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Use a custom package catalog instead of the standard one.
    pub fn catalog(mut self, catalog: PackageCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn config(mut self, config: CoachingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit(mut self, audit: SharedAuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> CoachingService<S, P> {
        let Self {
            store,
            processor,
            catalog,
            config,
            clock,
            audit,
        } = self;

        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit = audit.unwrap_or_else(|| Arc::new(NoOpAuditLogger));
        let catalog = Arc::new(catalog.unwrap_or_else(PackageCatalog::standard));
        let timeout = config.processor_timeout();
        let fee = config.fee_percent;

        let resolver = || {
            CoachAccountResolver::new(store.clone(), processor.clone(), clock.clone(), timeout)
        };

        let router = FundRouter::new(store.clone(), processor.clone(), fee, clock.clone(), timeout);
        let issuer = Arc::new(
            EntitlementIssuer::new(store.clone(), catalog.clone(), router, clock.clone())
                .with_audit(audit.clone())
                .with_placeholder_players(config.placeholder_players.clone()),
        );
        let accounts = Arc::new(resolver());
        let checkout = CheckoutManager::new(
            processor.clone(),
            catalog,
            resolver(),
            fee,
            config.currency.clone(),
            timeout,
        )
        .with_audit(audit.clone());
        let reconciler = Reconciler::new(store.clone(), processor.clone(), resolver(), fee, timeout);
        let guard = ConversationGuard::new(store.clone(), clock.clone())
            .with_daily_cap(config.daily_message_cap);
        let conversations = ConversationManager::new(store.clone(), clock.clone());
        let webhooks = WebhookHandler::new(store.clone(), issuer.clone(), accounts.clone(), clock.clone())
            .with_audit(audit);
        if config.webhook_secret.expose_secret().trim().is_empty() {
            tracing::warn!(
                target: "coachline::webhook",
                "No webhook secret configured, webhook deliveries will be refused"
            );
        }
        let verifier = WebhookVerifier::new(config.webhook_secret.clone(), clock.clone())
            .with_tolerance(config.webhook_tolerance_secs);

        CoachingService {
            store,
            processor,
            config,
            clock,
            checkout,
            issuer,
            accounts,
            reconciler,
            guard,
            conversations,
            webhooks,
            verifier,
        }
    }
}

impl<S, P> CoachingService<S, P>
where
    S: LedgerStore + Clone,
    P: PaymentProcessor + Clone,
{
    /// Start building a service over a store and processor.
    pub fn builder(store: S, processor: P) -> CoachingServiceBuilder<S, P> {
        CoachingServiceBuilder {
            store,
            processor,
            catalog: None,
            config: CoachingConfig::default(),
            clock: None,
            audit: None,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &CoachingConfig {
        &self.config
    }

    /// The ledger store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // Checkout and issuance

    pub async fn create_checkout(&self, request: CheckoutRequest) -> CoachingResult<CheckoutSession> {
        self.checkout.create_checkout(request).await
    }

    /// Issue the entitlement for a successful payment.
    pub async fn create_entitlement_from_payment(
        &self,
        event: &PaymentEvent,
    ) -> CoachingResult<IssueOutcome> {
        self.issuer.issue(event).await
    }

    /// Confirm a charge directly with the processor and issue its entitlement.
    ///
    /// Used by clients returning from checkout, ahead of the webhook.
    pub async fn confirm_payment(&self, charge_id: &str) -> CoachingResult<IssueOutcome> {
        let charge = with_timeout(
            "retrieve_charge",
            self.config.processor_timeout(),
            self.processor.retrieve_charge(charge_id),
        )
        .await?;

        if charge.status != ChargeStatus::Succeeded {
            return Err(CoachingError::InvalidPaymentEvent {
                message: format!("charge {} has not succeeded ({:?})", charge.id, charge.status),
            });
        }

        let event = PaymentEvent::from_charge(&charge)?;
        self.issuer.issue(&event).await
    }

    /// Verify and process a raw webhook delivery.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> CoachingResult<WebhookOutcome> {
        let event = self.verifier.verify_event(payload, signature_header)?;
        self.webhooks.handle_event(event).await
    }

    // Reconciliation

    pub async fn get_provider_transfer_summary(
        &self,
        provider_id: &str,
        limit: Option<usize>,
    ) -> CoachingResult<ProviderTransferReport> {
        self.reconciler.list_provider_transfers(provider_id, limit).await
    }

    // Conversations

    pub async fn send_message(&self, request: SendMessageRequest) -> CoachingResult<Message> {
        self.guard.send_message(request).await
    }

    pub async fn get_remaining_quota(&self, conversation_id: &str) -> CoachingResult<QuotaSnapshot> {
        self.guard.remaining_quota(conversation_id).await
    }

    pub async fn mark_read(&self, conversation_id: &str, role: SenderRole) -> CoachingResult<()> {
        self.guard.mark_read(conversation_id, role).await
    }

    pub async fn list_messages(&self, conversation_id: &str) -> CoachingResult<Vec<Message>> {
        self.guard.messages(conversation_id).await
    }

    pub async fn list_provider_conversations(
        &self,
        provider_id: &str,
    ) -> CoachingResult<Vec<Conversation>> {
        self.conversations.list_for_provider(provider_id).await
    }

    // Coach accounts

    pub async fn link_coach_account(
        &self,
        provider_id: &str,
        account_ref: &str,
    ) -> CoachingResult<CoachAccount> {
        self.accounts.link_account(provider_id, account_ref).await
    }

    pub async fn refresh_coach_account(&self, provider_id: &str) -> CoachingResult<CoachAccount> {
        self.accounts.refresh(provider_id).await
    }

    /// Drop processed-event markers older than `retention`.
    pub async fn cleanup_processed_events(&self, retention: chrono::Duration) -> CoachingResult<usize> {
        let removed = self
            .store
            .cleanup_old_events(self.clock.now() - retention)
            .await?;
        if removed > 0 {
            tracing::info!(target: "coachline::webhook", removed, "Cleaned up processed events");
        }
        Ok(removed)
    }
}
