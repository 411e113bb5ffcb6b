//! Conversation entitlement guard.
//!
//! Every inbound message passes through [`ConversationGuard::send_message`].
//! Player messages are checked against the entitlement currently linked to
//! the conversation, in order:
//!
//! 1. expired → [`CoachingError::ChatExpired`]
//! 2. video: a clip must remain, consumed with a conditional increment
//! 3. text: fewer than the daily cap sent since UTC midnight
//!
//! Provider and system messages bypass both gates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{CoachingError, CoachingResult};
use super::storage::{
    Conversation, Entitlement, EntitlementStatus, LedgerStore, Message, MessageType, SenderRole,
};
use crate::clock::{start_of_day, SharedClock};

/// Default number of player text messages allowed per day.
pub const DEFAULT_DAILY_MESSAGE_CAP: u32 = 5;

/// An inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub sender_id: String,
    pub role: SenderRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
}

/// Remaining consumption for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub conversation_id: String,
    pub entitlement_id: String,
    pub clips_remaining: u32,
    pub clips_total: u32,
    pub daily_messages_remaining: u32,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

/// Enforces entitlement limits on conversation messages.
pub struct ConversationGuard<S: LedgerStore> {
    store: S,
    clock: SharedClock,
    daily_cap: u32,
}

impl<S: LedgerStore> ConversationGuard<S> {
    /// Create a guard with the default daily cap.
    #[must_use]
    pub fn new(store: S, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            daily_cap: DEFAULT_DAILY_MESSAGE_CAP,
        }
    }

    /// Set the daily player text cap.
    #[must_use]
    pub fn with_daily_cap(mut self, cap: u32) -> Self {
        self.daily_cap = cap;
        self
    }

    /// Accept or refuse a message.
    pub async fn send_message(&self, request: SendMessageRequest) -> CoachingResult<Message> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(CoachingError::invalid("content", "must not be empty"));
        }

        let conversation = self.conversation(&request.conversation_id).await?;
        check_participant(&conversation, &request)?;

        let now = self.clock.now();
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation.id.clone(),
            sender_id: request.sender_id.clone(),
            sender_role: request.role,
            message_type: request.message_type,
            content: content.to_string(),
            created_at: now,
        };

        if request.role != SenderRole::Player {
            self.store.append_message(&message).await?;
            return Ok(message);
        }

        let entitlement = self.linked_entitlement(&conversation).await?;
        // Completed entitlements are closed the same way expired ones are.
        if entitlement.effective_status(now) != EntitlementStatus::Active {
            return Err(self.refuse(CoachingError::ChatExpired {
                conversation_id: conversation.id.clone(),
                expired_at: entitlement.expires_at,
            }));
        }

        match request.message_type {
            MessageType::Video => self.accept_clip(&conversation, &entitlement, message, now).await,
            MessageType::Text => self.accept_text(&conversation, message, now).await,
        }
    }

    /// Remaining clips and daily messages for a conversation.
    pub async fn remaining_quota(&self, conversation_id: &str) -> CoachingResult<QuotaSnapshot> {
        let conversation = self.conversation(conversation_id).await?;
        let entitlement = self.linked_entitlement(&conversation).await?;
        let now = self.clock.now();

        let sent_today = self
            .store
            .count_messages_since(
                &conversation.id,
                SenderRole::Player,
                MessageType::Text,
                start_of_day(now),
            )
            .await?;

        Ok(QuotaSnapshot {
            conversation_id: conversation.id,
            entitlement_id: entitlement.id.clone(),
            clips_remaining: entitlement.clips_remaining(),
            clips_total: entitlement.clip_allowance,
            daily_messages_remaining: self.daily_cap.saturating_sub(sent_today),
            expires_at: entitlement.expires_at,
            expired: entitlement.is_expired(now),
        })
    }

    /// Clear the unread count for one side of a conversation.
    pub async fn mark_read(&self, conversation_id: &str, role: SenderRole) -> CoachingResult<()> {
        self.conversation(conversation_id).await?;
        self.store.mark_conversation_read(conversation_id, role).await
    }

    /// Messages in a conversation, oldest first.
    pub async fn messages(&self, conversation_id: &str) -> CoachingResult<Vec<Message>> {
        self.conversation(conversation_id).await?;
        self.store.list_messages(conversation_id).await
    }

    async fn accept_clip(
        &self,
        conversation: &Conversation,
        entitlement: &Entitlement,
        message: Message,
        now: DateTime<Utc>,
    ) -> CoachingResult<Message> {
        let exhausted = || CoachingError::ClipsExhausted {
            conversation_id: conversation.id.clone(),
            allowance: entitlement.clip_allowance,
        };

        if entitlement.clips_remaining() == 0 {
            return Err(self.refuse(exhausted()));
        }

        let updated = self
            .store
            .consume_clip_if_available(&entitlement.id, now)
            .await?;
        if updated == 0 {
            // Lost the race for the last clip.
            return Err(self.refuse(exhausted()));
        }

        if let Err(e) = self.store.append_message(&message).await {
            tracing::error!(
                target: "coachline::guard",
                conversation_id = %conversation.id,
                entitlement_id = %entitlement.id,
                error = %e,
                "Clip consumed but message could not be stored"
            );
            return Err(e);
        }

        tracing::debug!(
            target: "coachline::guard",
            conversation_id = %conversation.id,
            entitlement_id = %entitlement.id,
            clips_used = entitlement.clips_consumed + 1,
            clip_allowance = entitlement.clip_allowance,
            "Clip accepted"
        );
        Ok(message)
    }

    async fn accept_text(
        &self,
        conversation: &Conversation,
        message: Message,
        now: DateTime<Utc>,
    ) -> CoachingResult<Message> {
        let accepted = self
            .store
            .append_message_within_cap(&message, start_of_day(now), self.daily_cap)
            .await?;

        if !accepted {
            return Err(self.refuse(CoachingError::DailyLimitReached {
                conversation_id: conversation.id.clone(),
                cap: self.daily_cap,
            }));
        }
        Ok(message)
    }

    async fn conversation(&self, conversation_id: &str) -> CoachingResult<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoachingError::ConversationNotFound {
                conversation_id: conversation_id.to_string(),
            })
    }

    async fn linked_entitlement(&self, conversation: &Conversation) -> CoachingResult<Entitlement> {
        self.store
            .get_entitlement(&conversation.linked_entitlement_id)
            .await?
            .ok_or_else(|| CoachingError::EntitlementNotFound {
                entitlement_id: conversation.linked_entitlement_id.clone(),
            })
    }

    fn refuse(&self, error: CoachingError) -> CoachingError {
        tracing::info!(
            target: "coachline::guard",
            reason = error.reason_code(),
            "{}", error
        );
        error
    }
}

fn check_participant(conversation: &Conversation, request: &SendMessageRequest) -> CoachingResult<()> {
    let expected = match request.role {
        SenderRole::Player => Some(&conversation.player_id),
        SenderRole::Provider => Some(&conversation.provider_id),
        SenderRole::System => None,
    };
    match expected {
        Some(id) if *id != request.sender_id => Err(CoachingError::invalid(
            "sender_id",
            "sender is not a participant in this conversation",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coaching::catalog::Tier;
    use crate::coaching::storage::{ConversationStatus, InMemoryLedgerStore, UnreadCounts};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    struct Fixture {
        store: InMemoryLedgerStore,
        clock: ManualClock,
        guard: ConversationGuard<InMemoryLedgerStore>,
    }

    async fn fixture(clip_allowance: u32) -> Fixture {
        let store = InMemoryLedgerStore::new();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        store
            .insert_entitlement_if_absent(&Entitlement {
                id: "ent_1".to_string(),
                payment_reference: "pi_1".to_string(),
                provider_id: "coach_1".to_string(),
                player_id: "player_1".to_string(),
                sport: "golf".to_string(),
                tier: Some(Tier::Two),
                gross_amount: 6075,
                currency: "usd".to_string(),
                clip_allowance,
                clips_consumed: 0,
                created_at: start,
                expires_at: start + Duration::days(5),
                status: EntitlementStatus::Active,
            })
            .await
            .unwrap();
        store
            .upsert_active_conversation(&Conversation {
                id: "conv_1".to_string(),
                player_id: "player_1".to_string(),
                provider_id: "coach_1".to_string(),
                sport: "golf".to_string(),
                linked_entitlement_id: "ent_1".to_string(),
                expiry_anchor_at: start,
                created_at: start,
                last_activity_at: start,
                unread_counts: UnreadCounts::default(),
                status: ConversationStatus::Active,
            })
            .await
            .unwrap();

        let guard = ConversationGuard::new(store.clone(), Arc::new(clock.clone()));
        Fixture { store, clock, guard }
    }

    fn request(role: SenderRole, message_type: MessageType) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: "conv_1".to_string(),
            sender_id: match role {
                SenderRole::Provider => "coach_1".to_string(),
                _ => "player_1".to_string(),
            },
            role,
            message_type,
            content: "swing video".to_string(),
        }
    }

    #[tokio::test]
    async fn test_daily_cap() {
        let f = fixture(3).await;
        for _ in 0..5 {
            f.guard
                .send_message(request(SenderRole::Player, MessageType::Text))
                .await
                .unwrap();
        }
        let err = f
            .guard
            .send_message(request(SenderRole::Player, MessageType::Text))
            .await
            .unwrap_err();
        assert!(matches!(err, CoachingError::DailyLimitReached { cap: 5, .. }));

        // Provider replies are not capped.
        f.guard
            .send_message(request(SenderRole::Provider, MessageType::Text))
            .await
            .unwrap();

        f.clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 1).unwrap());
        f.guard
            .send_message(request(SenderRole::Player, MessageType::Text))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clips_exhausted_without_mutation() {
        let f = fixture(1).await;
        f.guard
            .send_message(request(SenderRole::Player, MessageType::Video))
            .await
            .unwrap();
        let err = f
            .guard
            .send_message(request(SenderRole::Player, MessageType::Video))
            .await
            .unwrap_err();
        assert!(matches!(err, CoachingError::ClipsExhausted { allowance: 1, .. }));

        let entitlement = f.store.get_entitlement("ent_1").await.unwrap().unwrap();
        assert_eq!(entitlement.clips_consumed, 1);
        assert_eq!(f.store.list_messages("conv_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_blocks_player_not_provider() {
        let f = fixture(3).await;
        f.clock.advance(Duration::days(5) + Duration::seconds(1));

        for message_type in [MessageType::Text, MessageType::Video] {
            let err = f
                .guard
                .send_message(request(SenderRole::Player, message_type))
                .await
                .unwrap_err();
            assert!(matches!(err, CoachingError::ChatExpired { .. }));
        }

        f.guard
            .send_message(request(SenderRole::Provider, MessageType::Video))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let f = fixture(3).await;
        let mut req = request(SenderRole::Player, MessageType::Text);
        req.content = "   ".to_string();
        let err = f.guard.send_message(req).await.unwrap_err();
        assert!(matches!(err, CoachingError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_non_participant_rejected() {
        let f = fixture(3).await;
        let mut req = request(SenderRole::Player, MessageType::Text);
        req.sender_id = "player_2".to_string();
        assert!(f.guard.send_message(req).await.is_err());
    }

    #[tokio::test]
    async fn test_remaining_quota() {
        let f = fixture(3).await;
        f.guard
            .send_message(request(SenderRole::Player, MessageType::Video))
            .await
            .unwrap();
        f.guard
            .send_message(request(SenderRole::Player, MessageType::Text))
            .await
            .unwrap();

        let quota = f.guard.remaining_quota("conv_1").await.unwrap();
        assert_eq!(quota.clips_remaining, 2);
        assert_eq!(quota.clips_total, 3);
        assert_eq!(quota.daily_messages_remaining, 4);
        assert!(!quota.expired);
    }

    #[tokio::test]
    async fn test_unread_counts_and_mark_read() {
        let f = fixture(3).await;
        f.guard
            .send_message(request(SenderRole::Player, MessageType::Text))
            .await
            .unwrap();
        f.guard
            .send_message(request(SenderRole::Player, MessageType::Text))
            .await
            .unwrap();

        let conversation = f.store.get_conversation("conv_1").await.unwrap().unwrap();
        assert_eq!(conversation.unread_counts.provider, 2);
        assert_eq!(conversation.unread_counts.player, 0);

        f.guard.mark_read("conv_1", SenderRole::Provider).await.unwrap();
        let conversation = f.store.get_conversation("conv_1").await.unwrap().unwrap();
        assert_eq!(conversation.unread_counts.provider, 0);
    }
}
