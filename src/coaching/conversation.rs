//! Conversation management.
//!
//! There is at most one active conversation per (player, provider) pair. A
//! repurchase relinks the existing conversation to the new entitlement and
//! resets its expiry anchor instead of opening a second thread.

use super::error::{CoachingError, CoachingResult};
use super::storage::{Conversation, ConversationStatus, LedgerStore, SenderRole, UnreadCounts};
use crate::clock::SharedClock;

/// Manages conversations between players and providers.
pub struct ConversationManager<S: LedgerStore> {
    store: S,
    clock: SharedClock,
}

impl<S: LedgerStore> ConversationManager<S> {
    /// Create a new conversation manager.
    #[must_use]
    pub fn new(store: S, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Create the conversation for a pair, or link an existing one to
    /// `entitlement_id`.
    pub async fn upsert_conversation(
        &self,
        player_id: &str,
        provider_id: &str,
        sport: &str,
        entitlement_id: &str,
    ) -> CoachingResult<Conversation> {
        let now = self.clock.now();
        let candidate = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            player_id: player_id.to_string(),
            provider_id: provider_id.to_string(),
            sport: sport.to_string(),
            linked_entitlement_id: entitlement_id.to_string(),
            expiry_anchor_at: now,
            created_at: now,
            last_activity_at: now,
            unread_counts: UnreadCounts::default(),
            status: ConversationStatus::Active,
        };

        let conversation = self.store.upsert_active_conversation(&candidate).await?;

        tracing::debug!(
            target: "coachline::conversation",
            conversation_id = %conversation.id,
            player_id = %player_id,
            provider_id = %provider_id,
            entitlement_id = %entitlement_id,
            created = conversation.id == candidate.id,
            "Conversation linked to entitlement"
        );

        Ok(conversation)
    }

    /// Get a conversation, failing if it does not exist.
    pub async fn get(&self, conversation_id: &str) -> CoachingResult<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoachingError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })
    }

    /// Clear the unread count for one side.
    pub async fn mark_read(&self, conversation_id: &str, role: SenderRole) -> CoachingResult<()> {
        self.get(conversation_id).await?;
        self.store.mark_conversation_read(conversation_id, role).await
    }

    /// All conversations with a provider.
    pub async fn list_for_provider(&self, provider_id: &str) -> CoachingResult<Vec<Conversation>> {
        self.store.list_conversations_for_provider(provider_id).await
    }
}
