use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::Result,
    message::{
        message_models::{
            validate_content, AppendOutcome, Attachment, Conversation, Message, MessagePage,
            Participants, ReadReceipt,
        },
        message_repository::{
            conversation_not_found, message_not_found, not_sender, page_offset, MessageStore,
        },
    },
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, Conversation>,
    by_pair: HashMap<Participants, Uuid>,
    messages: HashMap<Uuid, Message>,
    /// Message ids per conversation in store order.
    timelines: HashMap<Uuid, Vec<Uuid>>,
}

impl Inner {
    fn conversation(&self, id: Uuid) -> Result<&Conversation> {
        self.conversations.get(&id).ok_or_else(conversation_not_found)
    }

    fn latest_in(&self, conversation_id: Uuid) -> Option<&Message> {
        self.timelines
            .get(&conversation_id)
            .and_then(|ids| ids.last())
            .and_then(|id| self.messages.get(id))
    }
}

/// Process-local `MessageStore`. A single write lock covers each mutation, so
/// every operation is trivially atomic.
#[derive(Default)]
pub struct InMemoryMessageStore {
    inner: RwLock<Inner>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.inner.read().await.conversations.get(&conversation_id).cloned())
    }

    async fn find_conversation_between(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let participants = Participants::new(a, b)?;
        let inner = self.inner.read().await;
        Ok(inner
            .by_pair
            .get(&participants)
            .and_then(|id| inner.conversations.get(id))
            .cloned())
    }

    async fn find_or_create_conversation(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        let participants = Participants::new(a, b)?;
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.by_pair.get(&participants).and_then(|id| inner.conversations.get(id)) {
            return Ok(existing.clone());
        }

        let conversation = Conversation::new(participants);
        inner.by_pair.insert(participants, conversation.id);
        inner.timelines.insert(conversation.id, Vec::new());
        inner.conversations.insert(conversation.id, conversation.clone());

        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<AppendOutcome> {
        let mut inner = self.inner.write().await;

        inner.conversation(conversation_id)?.ensure_participant(sender_id)?;
        validate_content(text, attachments)?;

        let message = Message::new(conversation_id, sender_id, text, attachments);
        inner.messages.insert(message.id, message.clone());
        inner.timelines.entry(conversation_id).or_default().push(message.id);

        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(conversation_not_found)?;
        conversation.record_message(&message);

        Ok(AppendOutcome {
            conversation: conversation.clone(),
            message,
        })
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        let mut inner = self.inner.write().await;
        inner.conversation(conversation_id)?.ensure_participant(reader_id)?;

        let Inner {
            conversations,
            messages,
            timelines,
            ..
        } = &mut *inner;

        let mut marked = 0;
        for id in timelines.get(&conversation_id).into_iter().flatten() {
            if let Some(message) = messages.get_mut(id) {
                if message.sender_id != reader_id && !message.is_read {
                    message.is_read = true;
                    marked += 1;
                }
            }
        }

        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or_else(conversation_not_found)?;
        conversation.reset_unread(reader_id);

        Ok(ReadReceipt {
            conversation: conversation.clone(),
            marked,
        })
    }

    async fn delete_message(&self, message_id: Uuid, requester_id: Uuid) -> Result<Conversation> {
        let mut inner = self.inner.write().await;

        let message = inner.messages.get(&message_id).ok_or_else(message_not_found)?;
        if message.sender_id != requester_id {
            return Err(not_sender());
        }
        let conversation_id = message.conversation_id;
        inner.conversation(conversation_id)?;

        let removed = inner.messages.remove(&message_id).ok_or_else(message_not_found)?;
        if let Some(timeline) = inner.timelines.get_mut(&conversation_id) {
            timeline.retain(|id| *id != message_id);
        }

        let latest = inner.latest_in(conversation_id).cloned();
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(conversation_not_found)?;
        conversation.record_deletion(&removed, latest.as_ref());

        Ok(conversation.clone())
    }

    async fn list_conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let inner = self.inner.read().await;
        let mut conversations: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.is_participant(user_id) && c.last_message_at.is_some())
            .cloned()
            .collect();

        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        Ok(conversations)
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        let inner = self.inner.read().await;
        inner.conversation(conversation_id)?.ensure_participant(requester_id)?;

        let timeline = inner.timelines.get(&conversation_id).map(Vec::as_slice).unwrap_or(&[]);
        let total = timeline.len() as i64;

        let mut messages: Vec<Message> = timeline
            .iter()
            .rev()
            .skip(page_offset(page, page_size) as usize)
            .take(page_size as usize)
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect();
        messages.reverse();

        Ok(MessagePage { messages, total })
    }

    async fn total_unread_for(&self, user_id: Uuid) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.is_participant(user_id))
            .map(|c| c.unread_for(user_id))
            .sum())
    }
}
