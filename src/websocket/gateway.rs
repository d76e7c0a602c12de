use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    connection::{ConnectionManager, SessionId},
    locks::KeyedLocks,
    presence::PresenceStore,
    types::{
        ClientMessage, MessageErrorPayload, MessageNotificationPayload, MessageSentPayload,
        MessagesReadPayload, NewMessagePayload, PresencePayload, SendMessagePayload,
        TypingPayload, TypingSignal, WsMessage,
    },
};
use crate::{
    error::Result,
    message::{message_models::validate_content, MessageService},
    user::UserProfile,
};

/// An authenticated realtime session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user: UserProfile,
}

/// Routes realtime events for every session of this process.
///
/// Writes go through the same `MessageService` as the REST handlers. Presence
/// may be shared between instances, but room and private-channel fan-out only
/// reaches sessions connected to this process.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    connections: ConnectionManager,
    presence: Arc<dyn PresenceStore>,
    messages: MessageService,
    conversation_locks: KeyedLocks<Uuid>,
    presence_locks: KeyedLocks<Uuid>,
}

impl Gateway {
    pub fn new(messages: MessageService, presence: Arc<dyn PresenceStore>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                connections: ConnectionManager::new(),
                presence,
                messages,
                conversation_locks: KeyedLocks::new(),
                presence_locks: KeyedLocks::new(),
            }),
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// Registers a new session and joins it to the user's private channel.
    /// The returned receiver yields every event addressed to this session.
    pub async fn connect(
        &self,
        user: UserProfile,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<WsMessage>) {
        let inner = &self.inner;
        let session_id = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        // Held until the announcement is out, so a closing session of the same
        // user cannot broadcast user_offline after this user_online.
        let presence_guard = inner.presence_locks.lock(user.id).await;

        let connected_here = inner.connections.is_connected(user.id);
        inner.connections.add_connection(session_id, user.id, tx);

        let first_session = match inner.presence.register(user.id, session_id).await {
            Ok(first) => first,
            Err(e) => {
                tracing::warn!(user_id = %user.id, %session_id, "Presence register failed: {}", e);
                !connected_here
            }
        };

        if first_session {
            inner.connections.broadcast_except(
                session_id,
                WsMessage::UserOnline(PresencePayload {
                    user_id: user.id,
                    email: user.email.clone(),
                }),
            );
        }
        drop(presence_guard);

        let online = match inner.presence.online_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!(user_id = %user.id, %session_id, "Presence lookup failed: {}", e);
                inner.connections.connected_users()
            }
        };
        inner
            .connections
            .send_to_session(session_id, WsMessage::OnlineUsers(online));

        tracing::info!(user_id = %user.id, %session_id, "Realtime session connected");

        (SessionHandle { session_id, user }, rx)
    }

    pub async fn disconnect(&self, handle: &SessionHandle) {
        let inner = &self.inner;
        let user = &handle.user;

        inner.connections.remove_connection(handle.session_id);

        let _presence_guard = inner.presence_locks.lock(user.id).await;
        let now_offline = match inner.presence.unregister(user.id, handle.session_id).await {
            Ok(offline) => offline,
            Err(e) => {
                tracing::warn!(user_id = %user.id, session_id = %handle.session_id, "Presence unregister failed: {}", e);
                !inner.connections.is_connected(user.id)
            }
        };

        if now_offline {
            inner.connections.broadcast(WsMessage::UserOffline(PresencePayload {
                user_id: user.id,
                email: user.email.clone(),
            }));
        }

        tracing::info!(user_id = %user.id, session_id = %handle.session_id, "Realtime session closed");
    }

    /// Extends the session's presence lease. Called on every heartbeat.
    pub async fn refresh_presence(&self, handle: &SessionHandle) {
        if let Err(e) = self
            .inner
            .presence
            .refresh(handle.user.id, handle.session_id)
            .await
        {
            tracing::warn!(user_id = %handle.user.id, session_id = %handle.session_id, "Presence refresh failed: {}", e);
        }
    }

    /// Handles one text frame. Failures are reported to the session as events
    /// and never close the connection.
    pub async fn handle_text(&self, handle: &SessionHandle, text: &str) {
        match ClientMessage::parse(text) {
            Ok(message) => self.dispatch(handle, message).await,
            Err(rejected) => {
                tracing::warn!(user_id = %handle.user.id, "Rejected frame: {}", rejected.reason);
                self.inner
                    .connections
                    .send_to_session(handle.session_id, rejected.into_event());
            }
        }
    }

    async fn dispatch(&self, handle: &SessionHandle, message: ClientMessage) {
        match message {
            ClientMessage::JoinConversation(conversation_id) => {
                self.join_conversation(handle, conversation_id).await
            }
            ClientMessage::LeaveConversation(conversation_id) => {
                self.inner
                    .connections
                    .leave_room(handle.session_id, conversation_id);
            }
            ClientMessage::SendMessage(payload) => self.send_message(handle, payload).await,
            ClientMessage::TypingStart(signal) => {
                self.relay_typing(handle, signal, WsMessage::UserTyping)
            }
            ClientMessage::TypingStop(signal) => {
                self.relay_typing(handle, signal, WsMessage::UserStopTyping)
            }
            ClientMessage::MarkAsRead(payload) => {
                self.mark_as_read(handle, payload.conversation_id).await
            }
            ClientMessage::Ping => {
                self.inner
                    .connections
                    .send_to_session(handle.session_id, WsMessage::Pong);
            }
        }
    }

    async fn join_conversation(&self, handle: &SessionHandle, conversation_id: Uuid) {
        let allowed = self
            .inner
            .messages
            .get_conversation(conversation_id)
            .await
            .and_then(|conversation| conversation.ensure_participant(handle.user.id));

        match allowed {
            Ok(()) => {
                self.inner
                    .connections
                    .join_room(handle.session_id, conversation_id);
            }
            Err(e) => {
                tracing::warn!(user_id = %handle.user.id, %conversation_id, "join_conversation refused: {}", e);
                self.inner
                    .connections
                    .send_to_session(handle.session_id, WsMessage::error(e.public_message()));
            }
        }
    }

    /// The send runs in its own task: once a message reaches the store its
    /// events go out even if the socket that sent it is torn down meanwhile.
    async fn send_message(&self, handle: &SessionHandle, payload: SendMessagePayload) {
        let gateway = self.clone();
        let session = handle.clone();

        let task = tokio::spawn(async move {
            let temp_id = payload.temp_id.clone();

            if let Err(e) = gateway.deliver(&session, payload).await {
                tracing::warn!(user_id = %session.user.id, "send_message failed: {}", e);
                gateway.inner.connections.send_to_session(
                    session.session_id,
                    WsMessage::MessageError(MessageErrorPayload {
                        temp_id,
                        error: e.public_message(),
                    }),
                );
            }
        });

        if let Err(e) = task.await {
            tracing::error!(user_id = %handle.user.id, "send_message task failed: {}", e);
        }
    }

    async fn deliver(&self, handle: &SessionHandle, payload: SendMessagePayload) -> Result<()> {
        let inner = &self.inner;
        let sender = &handle.user;

        validate_content(&payload.message, &payload.attachments)?;
        let conversation_id = inner
            .messages
            .resolve_conversation(sender.id, payload.receiver_id, payload.conversation_id)
            .await?;

        // Room delivery order must match store order within a conversation.
        let _guard = inner.conversation_locks.lock(conversation_id).await;

        let result = inner
            .messages
            .deliver(
                sender,
                payload.receiver_id,
                Some(conversation_id),
                &payload.message,
                &payload.attachments,
            )
            .await;

        if let Ok(delivered) = &result {
            let message = &delivered.message;

            inner.connections.send_to_room(
                conversation_id,
                WsMessage::NewMessage(NewMessagePayload {
                    message: message.clone(),
                    conversation_id,
                    temp_id: payload.temp_id.clone(),
                }),
            );
            inner.connections.send_to_user(
                delivered.receiver_id,
                WsMessage::MessageNotification(MessageNotificationPayload {
                    conversation_id,
                    sender_id: sender.id,
                    sender_name: sender.display_name().to_string(),
                    message: message.text.clone(),
                    timestamp: message.created_at,
                }),
            );
            inner.connections.send_to_session(
                handle.session_id,
                WsMessage::MessageSent(MessageSentPayload {
                    temp_id: payload.temp_id,
                    message: message.clone(),
                    conversation_id,
                }),
            );
        }

        result.map(|_| ())
    }

    fn relay_typing(
        &self,
        handle: &SessionHandle,
        signal: TypingSignal,
        event: fn(TypingPayload) -> WsMessage,
    ) {
        self.inner.connections.send_to_user(
            signal.receiver_id,
            event(TypingPayload {
                conversation_id: signal.conversation_id,
                user_id: handle.user.id,
                user_name: handle.user.display_name().to_string(),
            }),
        );
    }

    async fn mark_as_read(&self, handle: &SessionHandle, conversation_id: Uuid) {
        let reader = handle.user.id;

        match self
            .inner
            .messages
            .mark_conversation_as_read(conversation_id, reader)
            .await
        {
            Ok(receipt) => {
                if let Some(other) = receipt.conversation.other_participant(reader) {
                    self.inner.connections.send_to_user(
                        other,
                        WsMessage::MessagesRead(MessagesReadPayload {
                            conversation_id,
                            read_by: reader,
                        }),
                    );
                }
            }
            Err(e) => {
                tracing::warn!(user_id = %reader, %conversation_id, "mark_as_read failed: {}", e);
                self.inner
                    .connections
                    .send_to_session(handle.session_id, WsMessage::error(e.public_message()));
            }
        }
    }
}
