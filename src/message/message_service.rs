use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    message::{
        message_dto::SendMessageRequest,
        message_models::{
            validate_content, Attachment, Conversation, ConversationResponse, MessageResponse,
            ReadReceipt,
        },
        message_repository::{conversation_not_found, MessageStore},
    },
    user::{IdentityLookup, UserProfile},
};

/// A stored message together with the conversation state it produced.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub conversation: Conversation,
    pub receiver_id: Uuid,
    pub message: MessageResponse,
}

/// Business logic shared by the REST handlers and the realtime gateway, so
/// both entry points write through the same store operations.
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn MessageStore>,
    users: Arc<dyn IdentityLookup>,
}

impl MessageService {
    pub fn new(store: Arc<dyn MessageStore>, users: Arc<dyn IdentityLookup>) -> Self {
        Self { store, users }
    }

    async fn require_user(&self, user_id: Uuid, what: &str) -> Result<UserProfile> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} not found", what)))
    }

    /// REST send: the conversation is created on first contact.
    pub async fn send_message(
        &self,
        sender: &UserProfile,
        payload: SendMessageRequest,
    ) -> Result<MessageResponse> {
        let receiver_id = payload
            .receiver_id
            .ok_or_else(|| AppError::Validation("Receiver ID is required".to_string()))?;
        let text = payload.message.unwrap_or_default();

        let delivered = self
            .deliver(sender, receiver_id, None, &text, &payload.attachments)
            .await?;

        Ok(delivered.message)
    }

    /// Resolves the conversation (explicit id, or by pair with lazy creation)
    /// and appends the message.
    pub async fn deliver(
        &self,
        sender: &UserProfile,
        receiver_id: Uuid,
        conversation_id: Option<Uuid>,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<DeliveredMessage> {
        validate_content(text, attachments)?;

        let conversation_id = self
            .resolve_conversation(sender.id, receiver_id, conversation_id)
            .await?;

        let outcome = self
            .store
            .append_message(conversation_id, sender.id, text, attachments)
            .await?;

        Ok(DeliveredMessage {
            receiver_id,
            conversation: outcome.conversation,
            message: MessageResponse::new(outcome.message, Some(sender.clone())),
        })
    }

    pub async fn resolve_conversation(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<Uuid> {
        match conversation_id {
            Some(id) => {
                let conversation = self.get_conversation(id).await?;
                conversation.ensure_participant(sender_id)?;
                if conversation.other_participant(sender_id) != Some(receiver_id) {
                    return Err(AppError::Validation(
                        "Receiver is not a participant of this conversation".to_string(),
                    ));
                }
                Ok(conversation.id)
            }
            None => {
                if sender_id == receiver_id {
                    return Err(AppError::Validation(
                        "Cannot send a message to yourself".to_string(),
                    ));
                }
                self.require_user(receiver_id, "Receiver").await?;
                Ok(self
                    .store
                    .find_or_create_conversation(sender_id, receiver_id)
                    .await?
                    .id)
            }
        }
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation> {
        self.store
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(conversation_not_found)
    }

    /// Conversation between the caller and `other_user_id`. Lookups never
    /// create conversations.
    pub async fn conversation_with(
        &self,
        user_id: Uuid,
        other_user_id: Uuid,
    ) -> Result<ConversationResponse> {
        if user_id == other_user_id {
            return Err(conversation_not_found());
        }
        let conversation = self
            .store
            .find_conversation_between(user_id, other_user_id)
            .await?
            .ok_or_else(conversation_not_found)?;

        let participant = self.users.find_by_id(other_user_id).await?;
        Ok(ConversationResponse::new(conversation, user_id, participant))
    }

    pub async fn get_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationResponse>> {
        let conversations = self.store.list_conversations_for(user_id).await?;

        let mut responses = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let participant = match conversation.other_participant(user_id) {
                Some(other) => self.users.find_by_id(other).await?,
                None => None,
            };
            responses.push(ConversationResponse::new(conversation, user_id, participant));
        }

        Ok(responses)
    }

    pub async fn get_messages(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<MessageResponse>, i64)> {
        let page = self
            .store
            .list_messages(conversation_id, user_id, page, limit)
            .await?;

        let mut senders: HashMap<Uuid, Option<UserProfile>> = HashMap::new();
        let mut responses = Vec::with_capacity(page.messages.len());
        for message in page.messages {
            let sender = match senders.get(&message.sender_id) {
                Some(cached) => cached.clone(),
                None => {
                    let profile = self.users.find_by_id(message.sender_id).await?;
                    senders.insert(message.sender_id, profile.clone());
                    profile
                }
            };
            responses.push(MessageResponse::new(message, sender));
        }

        Ok((responses, page.total))
    }

    pub async fn mark_conversation_as_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<ReadReceipt> {
        self.store.mark_conversation_read(conversation_id, user_id).await
    }

    pub async fn delete_message(&self, message_id: Uuid, user_id: Uuid) -> Result<()> {
        self.store.delete_message(message_id, user_id).await?;
        Ok(())
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<i64> {
        self.store.total_unread_for(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::InMemoryMessageStore, user::InMemoryUserDirectory};

    fn user(email: &str) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            email: email.to_string(),
            full_name: None,
            avatar_url: None,
            is_active: true,
        }
    }

    fn service(users: &[UserProfile]) -> MessageService {
        MessageService::new(
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(InMemoryUserDirectory::new(users.iter().cloned())),
        )
    }

    fn request(receiver_id: Uuid, message: &str) -> SendMessageRequest {
        SendMessageRequest {
            receiver_id: Some(receiver_id),
            message: Some(message.to_string()),
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn test_send_creates_conversation_and_attaches_sender() {
        let alice = user("alice@example.com");
        let bob = user("bob@example.com");
        let service = service(&[alice.clone(), bob.clone()]);

        let sent = service.send_message(&alice, request(bob.id, "hello")).await.unwrap();
        assert_eq!(sent.text, "hello");
        assert_eq!(sent.sender, Some(alice.clone()));

        let listed = service.get_conversations(bob.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, sent.conversation_id);
        assert_eq!(listed[0].participant, Some(alice.clone()));
        assert_eq!(listed[0].unread_count, 1);
        assert_eq!(listed[0].last_message, "hello");
    }

    #[tokio::test]
    async fn test_send_to_unknown_receiver_is_not_found() {
        let alice = user("alice@example.com");
        let service = service(&[alice.clone()]);

        let err = service
            .send_message(&alice, request(Uuid::new_v4(), "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(service.get_conversations(alice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_self_is_rejected() {
        let alice = user("alice@example.com");
        let service = service(&[alice.clone()]);

        let err = service.send_message(&alice, request(alice.id, "me")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_explicit_conversation_must_match_receiver() {
        let alice = user("alice@example.com");
        let bob = user("bob@example.com");
        let carol = user("carol@example.com");
        let service = service(&[alice.clone(), bob.clone(), carol.clone()]);

        let sent = service.send_message(&alice, request(bob.id, "hi")).await.unwrap();

        let err = service
            .deliver(&alice, carol.id, Some(sent.conversation_id), "wrong", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = service
            .deliver(&carol, bob.id, Some(sent.conversation_id), "intruder", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = service
            .deliver(&alice, bob.id, Some(Uuid::new_v4()), "gone", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let ok = service
            .deliver(&bob, alice.id, Some(sent.conversation_id), "reply", &[])
            .await
            .unwrap();
        assert_eq!(ok.receiver_id, alice.id);
        assert_eq!(ok.conversation.unread_for(alice.id), 1);
    }

    #[tokio::test]
    async fn test_empty_send_does_not_create_conversation() {
        let alice = user("alice@example.com");
        let bob = user("bob@example.com");
        let service = service(&[alice.clone(), bob.clone()]);

        let err = service.deliver(&alice, bob.id, None, "  ", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(matches!(
            service.conversation_with(alice.id, bob.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conversation_with_never_creates() {
        let alice = user("alice@example.com");
        let bob = user("bob@example.com");
        let service = service(&[alice.clone(), bob.clone()]);

        assert!(matches!(
            service.conversation_with(alice.id, bob.id).await,
            Err(AppError::NotFound(_))
        ));
        // still nothing after the failed lookup
        assert!(matches!(
            service.conversation_with(bob.id, alice.id).await,
            Err(AppError::NotFound(_))
        ));

        service.send_message(&alice, request(bob.id, "hi")).await.unwrap();
        let found = service.conversation_with(bob.id, alice.id).await.unwrap();
        assert_eq!(found.participant, Some(alice));
        assert_eq!(found.unread_count, 1);
    }

    #[tokio::test]
    async fn test_history_attaches_senders_and_hides_from_outsiders() {
        let alice = user("alice@example.com");
        let bob = user("bob@example.com");
        let carol = user("carol@example.com");
        let service = service(&[alice.clone(), bob.clone(), carol.clone()]);

        let sent = service.send_message(&alice, request(bob.id, "one")).await.unwrap();
        service.send_message(&bob, request(alice.id, "two")).await.unwrap();

        let (messages, total) = service
            .get_messages(sent.conversation_id, bob.id, 1, 50)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(messages[0].sender, Some(alice));
        assert_eq!(messages[1].sender, Some(bob));

        assert!(matches!(
            service.get_messages(sent.conversation_id, carol.id, 1, 50).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_unread_count_follows_reads() {
        let alice = user("alice@example.com");
        let bob = user("bob@example.com");
        let service = service(&[alice.clone(), bob.clone()]);

        let sent = service.send_message(&alice, request(bob.id, "one")).await.unwrap();
        service.send_message(&alice, request(bob.id, "two")).await.unwrap();
        assert_eq!(service.unread_count(bob.id).await.unwrap(), 2);
        assert_eq!(service.unread_count(alice.id).await.unwrap(), 0);

        service
            .mark_conversation_as_read(sent.conversation_id, bob.id)
            .await
            .unwrap();
        assert_eq!(service.unread_count(bob.id).await.unwrap(), 0);
    }
}
