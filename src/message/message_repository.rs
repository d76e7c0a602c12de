use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    message::message_models::{
        validate_content, AppendOutcome, Attachment, Conversation, Message, MessagePage,
        Participants, ReadReceipt, UnreadCounts,
    },
};

/// Durable storage for conversations and their messages.
///
/// Every mutating operation is atomic per conversation: concurrent writers on
/// the same conversation (REST and realtime) are serialized, writers on
/// different conversations never contend.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;

    /// Lookup by unordered pair. Never creates.
    async fn find_conversation_between(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>>;

    /// Returns the existing conversation untouched, or creates an empty one.
    async fn find_or_create_conversation(&self, a: Uuid, b: Uuid) -> Result<Conversation>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<AppendOutcome>;

    async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt>;

    async fn delete_message(&self, message_id: Uuid, requester_id: Uuid) -> Result<Conversation>;

    /// Conversations containing `user_id` that have at least one message,
    /// most recent activity first.
    async fn list_conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>>;

    /// Page 1 holds the newest `page_size` messages, returned oldest first.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage>;

    async fn total_unread_for(&self, user_id: Uuid) -> Result<i64>;
}

pub(crate) fn conversation_not_found() -> AppError {
    AppError::NotFound("Conversation not found".to_string())
}

pub(crate) fn message_not_found() -> AppError {
    AppError::NotFound("Message not found".to_string())
}

pub(crate) fn not_sender() -> AppError {
    AppError::Forbidden("Not authorized to delete this message".to_string())
}

pub(crate) fn page_offset(page: u32, page_size: u32) -> i64 {
    (page.max(1) as i64 - 1) * page_size as i64
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    participant_low: Uuid,
    participant_high: Uuid,
    last_message: String,
    last_message_id: Option<Uuid>,
    last_message_at: Option<DateTime<Utc>>,
    unread_low: i64,
    unread_high: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        let participants = Participants::from_ordered(row.participant_low, row.participant_high);
        Self {
            id: row.id,
            participants,
            last_message: row.last_message,
            last_message_id: row.last_message_id,
            last_message_at: row.last_message_at,
            unread_count: UnreadCounts::from_counts(participants, row.unread_low, row.unread_high),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    body: String,
    attachments: Json<Vec<Attachment>>,
    is_read: bool,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            text: row.body,
            attachments: row.attachments.0,
            is_read: row.is_read,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Locks the conversation row for the rest of the transaction.
    async fn lock_conversation(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
    ) -> Result<Conversation> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE id = $1 FOR UPDATE",
        )
        .bind(conversation_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(conversation_not_found)?;

        Ok(row.into())
    }

    async fn save_conversation(
        tx: &mut Transaction<'_, Postgres>,
        conversation: &Conversation,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message = $2,
                 last_message_id = $3,
                 last_message_at = $4,
                 unread_low = $5,
                 unread_high = $6,
                 updated_at = $7
             WHERE id = $1",
        )
        .bind(conversation.id)
        .bind(&conversation.last_message)
        .bind(conversation.last_message_id)
        .bind(conversation.last_message_at)
        .bind(conversation.unread_count.low())
        .bind(conversation.unread_count.high())
        .bind(conversation.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn find_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>("SELECT * FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Conversation::from))
    }

    async fn find_conversation_between(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let participants = Participants::new(a, b)?;
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE participant_low = $1 AND participant_high = $2",
        )
        .bind(participants.low())
        .bind(participants.high())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Conversation::from))
    }

    async fn find_or_create_conversation(&self, a: Uuid, b: Uuid) -> Result<Conversation> {
        if let Some(existing) = self.find_conversation_between(a, b).await? {
            return Ok(existing);
        }

        let fresh = Conversation::new(Participants::new(a, b)?);
        let inserted = sqlx::query_as::<_, ConversationRow>(
            "INSERT INTO conversations (id, participant_low, participant_high, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $4)
             ON CONFLICT (participant_low, participant_high) DO NOTHING
             RETURNING *",
        )
        .bind(fresh.id)
        .bind(fresh.participants.low())
        .bind(fresh.participants.high())
        .bind(fresh.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(row.into()),
            // Lost the race to a concurrent creator; theirs is the conversation.
            None => self
                .find_conversation_between(a, b)
                .await?
                .ok_or(AppError::InternalError),
        }
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;

        let mut conversation = Self::lock_conversation(&mut tx, conversation_id).await?;
        conversation.ensure_participant(sender_id)?;
        validate_content(text, attachments)?;

        // clock_timestamp() is read after the row lock, so created_at follows seq.
        let message: Message = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO messages (id, conversation_id, sender_id, body, attachments, created_at)
             VALUES ($1, $2, $3, $4, $5, clock_timestamp())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(conversation_id)
        .bind(sender_id)
        .bind(text)
        .bind(Json(attachments.to_vec()))
        .fetch_one(&mut *tx)
        .await?
        .into();

        conversation.record_message(&message);
        Self::save_conversation(&mut tx, &conversation).await?;
        tx.commit().await?;

        Ok(AppendOutcome {
            conversation,
            message,
        })
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid, reader_id: Uuid) -> Result<ReadReceipt> {
        let mut tx = self.pool.begin().await?;

        let mut conversation = Self::lock_conversation(&mut tx, conversation_id).await?;
        conversation.ensure_participant(reader_id)?;

        let marked = sqlx::query(
            "UPDATE messages
             SET is_read = TRUE
             WHERE conversation_id = $1 AND sender_id <> $2 AND is_read = FALSE",
        )
        .bind(conversation_id)
        .bind(reader_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if conversation.reset_unread(reader_id) {
            Self::save_conversation(&mut tx, &conversation).await?;
        }
        tx.commit().await?;

        Ok(ReadReceipt {
            conversation,
            marked,
        })
    }

    async fn delete_message(&self, message_id: Uuid, requester_id: Uuid) -> Result<Conversation> {
        let mut tx = self.pool.begin().await?;

        // Conversation lock first, then the message row, matching the lock
        // order of mark_conversation_read.
        let conversation_id: Uuid =
            sqlx::query_scalar("SELECT conversation_id FROM messages WHERE id = $1")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(message_not_found)?;

        let mut conversation = Self::lock_conversation(&mut tx, conversation_id).await?;

        let message: Message = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE id = $1 FOR UPDATE",
        )
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(message_not_found)?
        .into();

        if message.sender_id != requester_id {
            return Err(not_sender());
        }

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        let latest: Option<Message> = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Message::from);

        conversation.record_deletion(&message, latest.as_ref());
        Self::save_conversation(&mut tx, &conversation).await?;
        tx.commit().await?;

        Ok(conversation)
    }

    async fn list_conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations
             WHERE (participant_low = $1 OR participant_high = $1)
               AND last_message_at IS NOT NULL
             ORDER BY last_message_at DESC, created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Conversation::from).collect())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        requester_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        let conversation = self
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(conversation_not_found)?;
        conversation.ensure_participant(requester_id)?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages
             WHERE conversation_id = $1
             ORDER BY seq DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(conversation_id)
        .bind(page_size as i64)
        .bind(page_offset(page, page_size))
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(Message::from).collect();
        messages.reverse();

        Ok(MessagePage { messages, total })
    }

    async fn total_unread_for(&self, user_id: Uuid) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(CASE WHEN participant_low = $1 THEN unread_low ELSE unread_high END), 0)::BIGINT
             FROM conversations
             WHERE participant_low = $1 OR participant_high = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}
