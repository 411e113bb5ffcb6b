//! Ledger storage.
//!
//! The ledger is the system of record for entitlements, conversations,
//! messages, transfer attempts and connected coach accounts. Implement
//! [`LedgerStore`] to persist it to your database.
//!
//! Two operations are check-then-act sequences that concurrent requests
//! race on: creating the entitlement for a payment, and consuming a clip.
//! Both are exposed as single conditional writes
//! ([`insert_entitlement_if_absent`](LedgerStore::insert_entitlement_if_absent),
//! [`consume_clip_if_available`](LedgerStore::consume_clip_if_available))
//! and implementations MUST perform them atomically, e.g. in PostgreSQL:
//!
//! ```sql
//! INSERT INTO entitlements (...) VALUES (...)
//! ON CONFLICT (payment_reference) DO NOTHING;
//!
//! UPDATE entitlements
//! SET clips_consumed = clips_consumed + 1
//! WHERE id = $1 AND clips_consumed < clip_allowance
//!   AND status = 'active' AND expires_at >= $2;
//! ```
//!
//! The row count of the update is the value returned by
//! `consume_clip_if_available`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::Tier;
use super::error::CoachingResult;
use super::router::RoutingMode;

/// Trait for the ledger store.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Entitlements

    /// Insert the entitlement unless one already exists for its payment reference.
    async fn insert_entitlement_if_absent(
        &self,
        entitlement: &Entitlement,
    ) -> CoachingResult<InsertOutcome>;

    /// Get an entitlement by ID.
    async fn get_entitlement(&self, entitlement_id: &str) -> CoachingResult<Option<Entitlement>>;

    /// Get the entitlement issued for a payment.
    async fn get_entitlement_by_payment(
        &self,
        payment_reference: &str,
    ) -> CoachingResult<Option<Entitlement>>;

    /// Increment `clips_consumed` if the entitlement is active, unexpired at
    /// `now`, and below its allowance. Returns the number of rows updated
    /// (0 or 1).
    async fn consume_clip_if_available(
        &self,
        entitlement_id: &str,
        now: DateTime<Utc>,
    ) -> CoachingResult<u64>;

    // Conversations

    /// Get a conversation by ID.
    async fn get_conversation(&self, conversation_id: &str) -> CoachingResult<Option<Conversation>>;

    /// Link `candidate`'s entitlement to the active conversation for its
    /// (player, provider) pair, or insert `candidate` if none exists.
    ///
    /// When a conversation exists its `linked_entitlement_id`, `sport`,
    /// `expiry_anchor_at` and `last_activity_at` are taken from `candidate`
    /// and the stored row is returned.
    async fn upsert_active_conversation(
        &self,
        candidate: &Conversation,
    ) -> CoachingResult<Conversation>;

    /// All conversations with a provider.
    async fn list_conversations_for_provider(
        &self,
        provider_id: &str,
    ) -> CoachingResult<Vec<Conversation>>;

    /// Reset the unread count for one side of a conversation.
    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        role: SenderRole,
    ) -> CoachingResult<()>;

    // Messages

    /// Append a message, bumping the conversation's activity and the
    /// recipient's unread count.
    async fn append_message(&self, message: &Message) -> CoachingResult<()>;

    /// Append a message only if fewer than `cap` messages with the same
    /// sender role and type exist in the conversation since `since`.
    /// Returns whether the message was stored.
    async fn append_message_within_cap(
        &self,
        message: &Message,
        since: DateTime<Utc>,
        cap: u32,
    ) -> CoachingResult<bool>;

    /// Count messages by role and type in a conversation since `since`.
    async fn count_messages_since(
        &self,
        conversation_id: &str,
        role: SenderRole,
        message_type: MessageType,
        since: DateTime<Utc>,
    ) -> CoachingResult<u32>;

    /// Messages in a conversation, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> CoachingResult<Vec<Message>>;

    // Transfers

    /// Record a transfer attempt.
    async fn insert_transfer(&self, record: &TransferRecord) -> CoachingResult<()>;

    /// Transfer attempts routed to a connected account.
    async fn list_transfers_for_account(
        &self,
        account_ref: &str,
    ) -> CoachingResult<Vec<TransferRecord>>;

    /// The transfer attempt recorded for a payment, if any.
    async fn get_transfer_by_payment(
        &self,
        payment_reference: &str,
    ) -> CoachingResult<Option<TransferRecord>>;

    // Coach accounts

    /// Get a provider's connected account.
    async fn get_coach_account(&self, provider_id: &str) -> CoachingResult<Option<CoachAccount>>;

    /// Find the provider owning a processor account reference.
    async fn find_coach_account_by_ref(
        &self,
        account_ref: &str,
    ) -> CoachingResult<Option<CoachAccount>>;

    /// Save/update a connected account.
    async fn save_coach_account(&self, account: &CoachAccount) -> CoachingResult<()>;

    // Webhook idempotency

    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, event_id: &str) -> CoachingResult<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, event_id: &str, at: DateTime<Utc>) -> CoachingResult<()>;

    /// Remove processed-event markers older than `before` (default: no-op).
    async fn cleanup_old_events(&self, _before: DateTime<Utc>) -> CoachingResult<usize> {
        Ok(0)
    }
}

/// Result of a conditional entitlement insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entitlement was written.
    Inserted,
    /// An entitlement already exists for the payment reference.
    AlreadyExists(Entitlement),
}

/// Stored entitlement status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    Active,
    Completed,
    Expired,
}

impl EntitlementStatus {
    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

/// A time-boxed, quota-bounded grant of coaching access tied to one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    /// Processor payment reference; unique across entitlements.
    pub payment_reference: String,
    pub provider_id: String,
    pub player_id: String,
    pub sport: String,
    /// `None` when the quota came entirely from payment hints.
    pub tier: Option<Tier>,
    /// Amount paid, minor units.
    pub gross_amount: i64,
    pub currency: String,
    pub clip_allowance: u32,
    pub clips_consumed: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: EntitlementStatus,
}

impl Entitlement {
    /// Status as of `now`. An active entitlement past `expires_at` is expired.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> EntitlementStatus {
        match self.status {
            EntitlementStatus::Active if now > self.expires_at => EntitlementStatus::Expired,
            status => status,
        }
    }

    /// Check if the entitlement no longer grants access at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == EntitlementStatus::Expired
    }

    /// Clips left in the allowance.
    #[must_use]
    pub fn clips_remaining(&self) -> u32 {
        self.clip_allowance.saturating_sub(self.clips_consumed)
    }
}

/// Conversation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
}

/// Unread message counts per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub player: u32,
    pub provider: u32,
}

/// The message thread between a player and a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub player_id: String,
    pub provider_id: String,
    pub sport: String,
    /// The entitlement currently granting access.
    pub linked_entitlement_id: String,
    /// When the current entitlement was linked.
    pub expiry_anchor_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub unread_counts: UnreadCounts,
    pub status: ConversationStatus,
}

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Player,
    Provider,
    System,
}

/// Message payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Video,
}

/// An append-only conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_role: SenderRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Text body, or the video reference for clips.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Transfer attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Paid,
    Failed,
}

impl TransferStatus {
    /// Parse a processor transfer status string.
    #[must_use]
    pub fn from_processor(status: &str) -> Self {
        match status {
            "paid" | "succeeded" | "completed" => Self::Paid,
            "failed" | "canceled" | "reversed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }
}

/// Where a transfer row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferSource {
    Ledger,
    Processor,
}

/// A recorded movement of funds to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub payment_reference: String,
    pub provider_id: String,
    pub provider_account_ref: String,
    /// Processor charge the funds came from.
    pub charge_id: Option<String>,
    /// Processor transfer id (separate-transfer mode only).
    pub processor_transfer_id: Option<String>,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
    pub currency: String,
    pub status: TransferStatus,
    pub source: TransferSource,
    pub routing_mode: RoutingMode,
    /// Paying customer.
    pub customer_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A provider's connected processor account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachAccount {
    pub provider_id: String,
    pub processor_account_ref: Option<String>,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub updated_at: DateTime<Utc>,
}

impl CoachAccount {
    /// The account reference, if it can receive funds.
    #[must_use]
    pub fn usable_account_ref(&self) -> Option<&str> {
        self.processor_account_ref
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

pub use memory::InMemoryLedgerStore;

/// In-memory ledger store.
///
/// Suitable for tests and local development. All tables sit behind one
/// lock, which makes every conditional write atomic.
pub mod memory {
    use super::*;
    use crate::coaching::error::CoachingError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// In-memory ledger store.
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryLedgerStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        tables: RwLock<Tables>,
        fail_entitlement_writes: AtomicBool,
    }

    #[derive(Default)]
    struct Tables {
        entitlements: HashMap<String, Entitlement>,
        entitlement_by_payment: HashMap<String, String>,
        conversations: HashMap<String, Conversation>,
        /// Per conversation, in append order.
        messages: HashMap<String, Vec<Message>>,
        transfers: Vec<TransferRecord>,
        coach_accounts: HashMap<String, CoachAccount>,
        processed_events: HashMap<String, DateTime<Utc>>,
    }

    impl InMemoryLedgerStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make entitlement inserts fail, simulating a store outage after a
        /// successful charge.
        pub fn fail_entitlement_writes(&self, fail: bool) {
            self.inner
                .fail_entitlement_writes
                .store(fail, Ordering::SeqCst);
        }

        /// All entitlements.
        pub async fn entitlements(&self) -> Vec<Entitlement> {
            self.inner
                .tables
                .read()
                .await
                .entitlements
                .values()
                .cloned()
                .collect()
        }

        /// All transfer records.
        pub async fn transfers(&self) -> Vec<TransferRecord> {
            self.inner.tables.read().await.transfers.clone()
        }

        /// All conversations.
        pub async fn conversations(&self) -> Vec<Conversation> {
            self.inner
                .tables
                .read()
                .await
                .conversations
                .values()
                .cloned()
                .collect()
        }
    }

    fn bump_activity(tables: &mut Tables, message: &Message) {
        if let Some(conversation) = tables.conversations.get_mut(&message.conversation_id) {
            conversation.last_activity_at = message.created_at;
            match message.sender_role {
                SenderRole::Player => conversation.unread_counts.provider += 1,
                SenderRole::Provider => conversation.unread_counts.player += 1,
                SenderRole::System => {
                    conversation.unread_counts.player += 1;
                    conversation.unread_counts.provider += 1;
                }
            }
        }
    }

    fn push_message(tables: &mut Tables, message: &Message) {
        tables
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        bump_activity(tables, message);
    }

    /// Walks the conversation's log backwards and stops at the first message
    /// older than `since`.
    fn count_since(
        tables: &Tables,
        conversation_id: &str,
        role: SenderRole,
        message_type: MessageType,
        since: DateTime<Utc>,
    ) -> u32 {
        let Some(log) = tables.messages.get(conversation_id) else {
            return 0;
        };
        let count = log
            .iter()
            .rev()
            .take_while(|m| m.created_at >= since)
            .filter(|m| m.sender_role == role && m.message_type == message_type)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    #[async_trait]
    impl LedgerStore for InMemoryLedgerStore {
        async fn insert_entitlement_if_absent(
            &self,
            entitlement: &Entitlement,
        ) -> CoachingResult<InsertOutcome> {
            if self.inner.fail_entitlement_writes.load(Ordering::SeqCst) {
                return Err(CoachingError::store("entitlement write rejected"));
            }

            let mut tables = self.inner.tables.write().await;
            if let Some(existing_id) = tables
                .entitlement_by_payment
                .get(&entitlement.payment_reference)
            {
                let existing = tables
                    .entitlements
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| CoachingError::store("dangling payment index"))?;
                return Ok(InsertOutcome::AlreadyExists(existing));
            }

            tables.entitlement_by_payment.insert(
                entitlement.payment_reference.clone(),
                entitlement.id.clone(),
            );
            tables
                .entitlements
                .insert(entitlement.id.clone(), entitlement.clone());
            Ok(InsertOutcome::Inserted)
        }

        async fn get_entitlement(&self, entitlement_id: &str) -> CoachingResult<Option<Entitlement>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .entitlements
                .get(entitlement_id)
                .cloned())
        }

        async fn get_entitlement_by_payment(
            &self,
            payment_reference: &str,
        ) -> CoachingResult<Option<Entitlement>> {
            let tables = self.inner.tables.read().await;
            Ok(tables
                .entitlement_by_payment
                .get(payment_reference)
                .and_then(|id| tables.entitlements.get(id))
                .cloned())
        }

        async fn consume_clip_if_available(
            &self,
            entitlement_id: &str,
            now: DateTime<Utc>,
        ) -> CoachingResult<u64> {
            let mut tables = self.inner.tables.write().await;
            match tables.entitlements.get_mut(entitlement_id) {
                Some(e)
                    if e.status == EntitlementStatus::Active
                        && e.expires_at >= now
                        && e.clips_consumed < e.clip_allowance =>
                {
                    e.clips_consumed += 1;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }

        async fn get_conversation(
            &self,
            conversation_id: &str,
        ) -> CoachingResult<Option<Conversation>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .conversations
                .get(conversation_id)
                .cloned())
        }

        async fn upsert_active_conversation(
            &self,
            candidate: &Conversation,
        ) -> CoachingResult<Conversation> {
            let mut tables = self.inner.tables.write().await;
            let existing = tables.conversations.values_mut().find(|c| {
                c.status == ConversationStatus::Active
                    && c.player_id == candidate.player_id
                    && c.provider_id == candidate.provider_id
            });

            if let Some(conversation) = existing {
                conversation.linked_entitlement_id = candidate.linked_entitlement_id.clone();
                conversation.sport = candidate.sport.clone();
                conversation.expiry_anchor_at = candidate.expiry_anchor_at;
                conversation.last_activity_at = candidate.last_activity_at;
                return Ok(conversation.clone());
            }

            tables
                .conversations
                .insert(candidate.id.clone(), candidate.clone());
            Ok(candidate.clone())
        }

        async fn list_conversations_for_provider(
            &self,
            provider_id: &str,
        ) -> CoachingResult<Vec<Conversation>> {
            let tables = self.inner.tables.read().await;
            Ok(tables
                .conversations
                .values()
                .filter(|c| c.provider_id == provider_id)
                .cloned()
                .collect())
        }

        async fn mark_conversation_read(
            &self,
            conversation_id: &str,
            role: SenderRole,
        ) -> CoachingResult<()> {
            let mut tables = self.inner.tables.write().await;
            if let Some(conversation) = tables.conversations.get_mut(conversation_id) {
                match role {
                    SenderRole::Player => conversation.unread_counts.player = 0,
                    SenderRole::Provider => conversation.unread_counts.provider = 0,
                    SenderRole::System => {}
                }
            }
            Ok(())
        }

        async fn append_message(&self, message: &Message) -> CoachingResult<()> {
            let mut tables = self.inner.tables.write().await;
            push_message(&mut tables, message);
            Ok(())
        }

        async fn append_message_within_cap(
            &self,
            message: &Message,
            since: DateTime<Utc>,
            cap: u32,
        ) -> CoachingResult<bool> {
            let mut tables = self.inner.tables.write().await;
            let sent = count_since(
                &tables,
                &message.conversation_id,
                message.sender_role,
                message.message_type,
                since,
            );
            if sent >= cap {
                return Ok(false);
            }
            push_message(&mut tables, message);
            Ok(true)
        }

        async fn count_messages_since(
            &self,
            conversation_id: &str,
            role: SenderRole,
            message_type: MessageType,
            since: DateTime<Utc>,
        ) -> CoachingResult<u32> {
            let tables = self.inner.tables.read().await;
            Ok(count_since(&tables, conversation_id, role, message_type, since))
        }

        async fn list_messages(&self, conversation_id: &str) -> CoachingResult<Vec<Message>> {
            let tables = self.inner.tables.read().await;
            Ok(tables
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn insert_transfer(&self, record: &TransferRecord) -> CoachingResult<()> {
            self.inner.tables.write().await.transfers.push(record.clone());
            Ok(())
        }

        async fn list_transfers_for_account(
            &self,
            account_ref: &str,
        ) -> CoachingResult<Vec<TransferRecord>> {
            let tables = self.inner.tables.read().await;
            Ok(tables
                .transfers
                .iter()
                .filter(|t| t.provider_account_ref == account_ref)
                .cloned()
                .collect())
        }

        async fn get_transfer_by_payment(
            &self,
            payment_reference: &str,
        ) -> CoachingResult<Option<TransferRecord>> {
            let tables = self.inner.tables.read().await;
            Ok(tables
                .transfers
                .iter()
                .find(|t| t.payment_reference == payment_reference)
                .cloned())
        }

        async fn get_coach_account(&self, provider_id: &str) -> CoachingResult<Option<CoachAccount>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .coach_accounts
                .get(provider_id)
                .cloned())
        }

        async fn find_coach_account_by_ref(
            &self,
            account_ref: &str,
        ) -> CoachingResult<Option<CoachAccount>> {
            let tables = self.inner.tables.read().await;
            Ok(tables
                .coach_accounts
                .values()
                .find(|a| a.usable_account_ref() == Some(account_ref))
                .cloned())
        }

        async fn save_coach_account(&self, account: &CoachAccount) -> CoachingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .coach_accounts
                .insert(account.provider_id.clone(), account.clone());
            Ok(())
        }

        async fn is_event_processed(&self, event_id: &str) -> CoachingResult<bool> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .processed_events
                .contains_key(event_id))
        }

        async fn mark_event_processed(&self, event_id: &str, at: DateTime<Utc>) -> CoachingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .processed_events
                .insert(event_id.to_string(), at);
            Ok(())
        }

        async fn cleanup_old_events(&self, before: DateTime<Utc>) -> CoachingResult<usize> {
            let mut tables = self.inner.tables.write().await;
            let initial_len = tables.processed_events.len();
            tables.processed_events.retain(|_, at| *at >= before);
            Ok(initial_len - tables.processed_events.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn entitlement(id: &str, payment_reference: &str, allowance: u32) -> Entitlement {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Entitlement {
            id: id.to_string(),
            payment_reference: payment_reference.to_string(),
            provider_id: "coach_1".to_string(),
            player_id: "player_1".to_string(),
            sport: "golf".to_string(),
            tier: Some(Tier::Two),
            gross_amount: 6075,
            currency: "usd".to_string(),
            clip_allowance: allowance,
            clips_consumed: 0,
            created_at,
            expires_at: created_at + Duration::days(5),
            status: EntitlementStatus::Active,
        }
    }

    #[test]
    fn test_effective_status() {
        let e = entitlement("ent_1", "pi_1", 7);
        assert_eq!(e.effective_status(e.expires_at), EntitlementStatus::Active);
        assert!(e.is_expired(e.expires_at + Duration::seconds(1)));

        let mut completed = e.clone();
        completed.status = EntitlementStatus::Completed;
        assert_eq!(
            completed.effective_status(e.expires_at + Duration::days(1)),
            EntitlementStatus::Completed
        );
    }

    #[test]
    fn test_usable_account_ref() {
        let mut account = CoachAccount {
            provider_id: "coach_1".to_string(),
            processor_account_ref: Some("  ".to_string()),
            charges_enabled: true,
            payouts_enabled: true,
            details_submitted: true,
            updated_at: Utc::now(),
        };
        assert_eq!(account.usable_account_ref(), None);
        account.processor_account_ref = Some("acct_123".to_string());
        assert_eq!(account.usable_account_ref(), Some("acct_123"));
    }

    #[test]
    fn test_transfer_status_from_processor() {
        assert_eq!(TransferStatus::from_processor("paid"), TransferStatus::Paid);
        assert_eq!(TransferStatus::from_processor("reversed"), TransferStatus::Failed);
        assert_eq!(TransferStatus::from_processor("in_transit"), TransferStatus::Pending);
    }

    #[tokio::test]
    async fn test_insert_is_keyed_by_payment_reference() {
        let store = InMemoryLedgerStore::new();
        let first = entitlement("ent_1", "pi_1", 7);
        let second = entitlement("ent_2", "pi_1", 7);

        assert_eq!(
            store.insert_entitlement_if_absent(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        match store.insert_entitlement_if_absent(&second).await.unwrap() {
            InsertOutcome::AlreadyExists(existing) => assert_eq!(existing.id, "ent_1"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(store.entitlements().await.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_clip_stops_at_allowance() {
        let store = InMemoryLedgerStore::new();
        let e = entitlement("ent_1", "pi_1", 2);
        store.insert_entitlement_if_absent(&e).await.unwrap();

        let now = e.created_at;
        assert_eq!(store.consume_clip_if_available("ent_1", now).await.unwrap(), 1);
        assert_eq!(store.consume_clip_if_available("ent_1", now).await.unwrap(), 1);
        assert_eq!(store.consume_clip_if_available("ent_1", now).await.unwrap(), 0);

        let stored = store.get_entitlement("ent_1").await.unwrap().unwrap();
        assert_eq!(stored.clips_consumed, 2);
    }

    #[tokio::test]
    async fn test_consume_clip_refuses_expired() {
        let store = InMemoryLedgerStore::new();
        let e = entitlement("ent_1", "pi_1", 2);
        store.insert_entitlement_if_absent(&e).await.unwrap();

        let later = e.expires_at + Duration::minutes(1);
        assert_eq!(store.consume_clip_if_available("ent_1", later).await.unwrap(), 0);
    }

    fn text(conversation_id: &str, role: SenderRole, created_at: DateTime<Utc>) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: "player_1".to_string(),
            sender_role: role,
            message_type: MessageType::Text,
            content: "hi".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_cap_counts_only_the_window_and_conversation() {
        let store = InMemoryLedgerStore::new();
        let yesterday = Utc.with_ymd_and_hms(2024, 5, 1, 23, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let today = midnight + Duration::hours(9);

        for _ in 0..3 {
            store
                .append_message(&text("conv_1", SenderRole::Player, yesterday))
                .await
                .unwrap();
        }
        store
            .append_message(&text("conv_2", SenderRole::Player, today))
            .await
            .unwrap();
        store
            .append_message(&text("conv_1", SenderRole::Provider, today))
            .await
            .unwrap();

        let count = store
            .count_messages_since("conv_1", SenderRole::Player, MessageType::Text, midnight)
            .await
            .unwrap();
        assert_eq!(count, 0);

        assert!(store
            .append_message_within_cap(&text("conv_1", SenderRole::Player, today), midnight, 1)
            .await
            .unwrap());
        assert!(!store
            .append_message_within_cap(&text("conv_1", SenderRole::Player, today), midnight, 1)
            .await
            .unwrap());
        assert_eq!(store.list_messages("conv_1").await.unwrap().len(), 5);
        assert!(store.list_messages("conv_missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_cleanup() {
        let store = InMemoryLedgerStore::new();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        store.mark_event_processed("evt_old", old).await.unwrap();
        store.mark_event_processed("evt_new", recent).await.unwrap();

        let removed = store
            .cleanup_old_events(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.is_event_processed("evt_old").await.unwrap());
        assert!(store.is_event_processed("evt_new").await.unwrap());
    }
}
