use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    user::UserProfile,
};

/// The unordered pair of users in a conversation, stored in canonical order
/// so `(a, b)` and `(b, a)` compare and hash equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Participants {
    low: Uuid,
    high: Uuid,
}

impl Participants {
    pub fn new(a: Uuid, b: Uuid) -> Result<Self> {
        if a == b {
            return Err(AppError::Validation(
                "A conversation needs two distinct participants".to_string(),
            ));
        }
        Ok(Self::from_ordered(a.min(b), a.max(b)))
    }

    pub(crate) fn from_ordered(low: Uuid, high: Uuid) -> Self {
        Self { low, high }
    }

    pub fn low(&self) -> Uuid {
        self.low
    }

    pub fn high(&self) -> Uuid {
        self.high
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.low == user_id || self.high == user_id
    }

    pub fn other(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.low {
            Some(self.high)
        } else if user_id == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

/// Per-participant unread counters. Only the two participants have slots, so
/// the counter keys can never drift outside the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadCounts {
    participants: Participants,
    counts: [i64; 2],
}

impl UnreadCounts {
    pub fn new(participants: Participants) -> Self {
        Self::from_counts(participants, 0, 0)
    }

    pub(crate) fn from_counts(participants: Participants, low: i64, high: i64) -> Self {
        Self {
            participants,
            counts: [low, high],
        }
    }

    fn slot(&self, user_id: Uuid) -> Option<usize> {
        if user_id == self.participants.low {
            Some(0)
        } else if user_id == self.participants.high {
            Some(1)
        } else {
            None
        }
    }

    /// Missing participants read as zero.
    pub fn get(&self, user_id: Uuid) -> i64 {
        self.slot(user_id).map(|i| self.counts[i]).unwrap_or(0)
    }

    pub fn low(&self) -> i64 {
        self.counts[0]
    }

    pub fn high(&self) -> i64 {
        self.counts[1]
    }

    fn increment_except(&mut self, sender_id: Uuid) {
        for (i, user) in [self.participants.low, self.participants.high].into_iter().enumerate() {
            if user != sender_id {
                self.counts[i] += 1;
            }
        }
    }

    fn decrement(&mut self, user_id: Uuid) {
        if let Some(i) = self.slot(user_id) {
            self.counts[i] = (self.counts[i] - 1).max(0);
        }
    }

    fn reset(&mut self, user_id: Uuid) -> bool {
        match self.slot(user_id) {
            Some(i) if self.counts[i] != 0 => {
                self.counts[i] = 0;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Participants,
    pub last_message: String,
    pub last_message_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: UnreadCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(participants: Participants) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            participants,
            last_message: String::new(),
            last_message_id: None,
            last_message_at: None,
            unread_count: UnreadCounts::new(participants),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(user_id)
    }

    pub fn ensure_participant(&self, user_id: Uuid) -> Result<()> {
        if self.is_participant(user_id) {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "Not authorized to access this conversation".to_string(),
            ))
        }
    }

    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        self.participants.other(user_id)
    }

    pub fn unread_for(&self, user_id: Uuid) -> i64 {
        self.unread_count.get(user_id)
    }

    /// Points the conversation at `message` and bumps every other
    /// participant's unread counter.
    pub fn record_message(&mut self, message: &Message) {
        self.last_message = message.text.clone();
        self.last_message_id = Some(message.id);
        self.last_message_at = Some(message.created_at);
        self.unread_count.increment_except(message.sender_id);
        self.updated_at = Utc::now();
    }

    /// Returns false when `reader_id` already had nothing unread.
    pub fn reset_unread(&mut self, reader_id: Uuid) -> bool {
        let changed = self.unread_count.reset(reader_id);
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Applies the removal of `deleted`. `latest_remaining` is the newest
    /// message left in the conversation after the removal.
    pub fn record_deletion(&mut self, deleted: &Message, latest_remaining: Option<&Message>) {
        if !deleted.is_read {
            if let Some(reader) = self.other_participant(deleted.sender_id) {
                self.unread_count.decrement(reader);
            }
        }

        if self.last_message_id == Some(deleted.id) {
            match latest_remaining {
                Some(latest) => {
                    self.last_message = latest.text.clone();
                    self.last_message_id = Some(latest.id);
                    self.last_message_at = Some(latest.created_at);
                }
                None => {
                    self.last_message = String::new();
                    self.last_message_id = None;
                    self.last_message_at = None;
                }
            }
        }
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: Uuid, sender_id: Uuid, text: &str, attachments: &[Attachment]) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            text: text.to_string(),
            attachments: attachments.to_vec(),
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

/// A message must carry text or at least one attachment, and every
/// attachment needs a url.
pub fn validate_content(text: &str, attachments: &[Attachment]) -> Result<()> {
    if text.trim().is_empty() && attachments.is_empty() {
        return Err(AppError::Validation(
            "Message text or attachments are required".to_string(),
        ));
    }
    if attachments.iter().any(|a| a.url.trim().is_empty()) {
        return Err(AppError::Validation("Attachment url is required".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub conversation: Conversation,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct ReadReceipt {
    pub conversation: Conversation,
    /// Messages flipped to read by this call.
    pub marked: u64,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    /// Oldest first.
    pub messages: Vec<Message>,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender: Option<UserProfile>,
    #[serde(rename = "message")]
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageResponse {
    pub fn new(message: Message, sender: Option<UserProfile>) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender,
            text: message.text,
            attachments: message.attachments,
            is_read: message.is_read,
            created_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub id: Uuid,
    pub participant: Option<UserProfile>,
    pub last_message: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationResponse {
    pub fn new(conversation: Conversation, viewer_id: Uuid, participant: Option<UserProfile>) -> Self {
        Self {
            id: conversation.id,
            participant,
            unread_count: conversation.unread_for(viewer_id),
            last_message: conversation.last_message,
            last_message_at: conversation.last_message_at,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Uuid, Uuid, Participants) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        (a, b, Participants::new(a, b).unwrap())
    }

    #[test]
    fn test_participants_are_order_independent() {
        let (a, b, p) = pair();
        assert_eq!(p, Participants::new(b, a).unwrap());
        assert_eq!(p.other(a), Some(b));
        assert_eq!(p.other(b), Some(a));
        assert_eq!(p.other(Uuid::new_v4()), None);
    }

    #[test]
    fn test_self_conversation_rejected() {
        let a = Uuid::new_v4();
        assert!(matches!(Participants::new(a, a), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_unread_counts_only_track_participants() {
        let (a, b, p) = pair();
        let mut conversation = Conversation::new(p);
        let message = Message::new(conversation.id, a, "hi", &[]);
        conversation.record_message(&message);

        assert_eq!(conversation.unread_for(b), 1);
        assert_eq!(conversation.unread_for(a), 0);
        assert_eq!(conversation.unread_for(Uuid::new_v4()), 0);
        assert_eq!(conversation.last_message, "hi");
        assert_eq!(conversation.last_message_id, Some(message.id));
    }

    #[test]
    fn test_reset_unread_reports_change() {
        let (a, b, p) = pair();
        let mut conversation = Conversation::new(p);
        conversation.record_message(&Message::new(conversation.id, a, "hi", &[]));

        assert!(conversation.reset_unread(b));
        assert!(!conversation.reset_unread(b));
        assert_eq!(conversation.unread_for(b), 0);
    }

    #[test]
    fn test_deleting_last_message_falls_back_to_latest_remaining() {
        let (a, b, p) = pair();
        let mut conversation = Conversation::new(p);
        let first = Message::new(conversation.id, a, "first", &[]);
        let second = Message::new(conversation.id, b, "second", &[]);
        conversation.record_message(&first);
        conversation.record_message(&second);

        conversation.record_deletion(&second, Some(&first));
        assert_eq!(conversation.last_message, "first");
        assert_eq!(conversation.last_message_id, Some(first.id));
        // second was unread by a
        assert_eq!(conversation.unread_for(a), 0);
        assert_eq!(conversation.unread_for(b), 1);

        conversation.record_deletion(&first, None);
        assert_eq!(conversation.last_message, "");
        assert_eq!(conversation.last_message_at, None);
        assert_eq!(conversation.unread_for(b), 0);
    }

    #[test]
    fn test_deleting_same_text_does_not_touch_last_message() {
        let (a, _b, p) = pair();
        let mut conversation = Conversation::new(p);
        let older = Message::new(conversation.id, a, "same", &[]);
        let newer = Message::new(conversation.id, a, "same", &[]);
        conversation.record_message(&older);
        conversation.record_message(&newer);

        conversation.record_deletion(&older, Some(&newer));
        assert_eq!(conversation.last_message_id, Some(newer.id));
    }

    #[test]
    fn test_validate_content() {
        assert!(validate_content("hello", &[]).is_ok());
        assert!(validate_content("   ", &[]).is_err());

        let file = Attachment {
            name: "cv.pdf".into(),
            url: "https://files.example.com/cv.pdf".into(),
            kind: "application/pdf".into(),
        };
        assert!(validate_content("", &[file.clone()]).is_ok());

        let broken = Attachment { url: String::new(), ..file };
        assert!(validate_content("hi", &[broken]).is_err());
    }

    #[test]
    fn test_message_response_wire_names() {
        let message = Message::new(Uuid::new_v4(), Uuid::new_v4(), "hello", &[]);
        let json = serde_json::to_value(MessageResponse::new(message, None)).unwrap();
        assert_eq!(json["message"], "hello");
        assert!(json.get("conversationId").is_some());
        assert_eq!(json["isRead"], false);
    }
}
