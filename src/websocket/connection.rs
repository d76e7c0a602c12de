use dashmap::DashMap;
use std::{collections::HashSet, fmt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::WsMessage;

pub type WsSender = mpsc::UnboundedSender<WsMessage>;

/// One live socket. A user may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Session {
    user_id: Uuid,
    sender: WsSender,
    rooms: HashSet<Uuid>,
}

/// Local registry of sockets, indexed by session, by user (the private
/// channel) and by conversation room.
///
/// Guards on two maps are never held at the same time; recipient sets are
/// copied out before sending.
#[derive(Default)]
pub struct ConnectionManager {
    sessions: DashMap<SessionId, Session>,
    users: DashMap<Uuid, HashSet<SessionId>>,
    rooms: DashMap<Uuid, HashSet<SessionId>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, session_id: SessionId, user_id: Uuid, sender: WsSender) {
        self.sessions.insert(
            session_id,
            Session {
                user_id,
                sender,
                rooms: HashSet::new(),
            },
        );
        self.users.entry(user_id).or_default().insert(session_id);
    }

    /// Drops the session from every index. Returns the owning user.
    pub fn remove_connection(&self, session_id: SessionId) -> Option<Uuid> {
        let (_, session) = self.sessions.remove(&session_id)?;

        for room in &session.rooms {
            remove_member(&self.rooms, *room, session_id);
        }
        remove_member(&self.users, session.user_id, session_id);

        Some(session.user_id)
    }

    pub fn join_room(&self, session_id: SessionId, conversation_id: Uuid) -> bool {
        let joined = match self.sessions.get_mut(&session_id) {
            Some(mut session) => {
                session.rooms.insert(conversation_id);
                true
            }
            None => false,
        };
        if joined {
            self.rooms
                .entry(conversation_id)
                .or_default()
                .insert(session_id);
        }
        joined
    }

    pub fn leave_room(&self, session_id: SessionId, conversation_id: Uuid) {
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.rooms.remove(&conversation_id);
        }
        remove_member(&self.rooms, conversation_id, session_id);
    }

    pub fn send_to_session(&self, session_id: SessionId, message: WsMessage) {
        if let Some(session) = self.sessions.get(&session_id) {
            let _ = session.sender.send(message);
        }
    }

    /// Sends to every session of `user_id`.
    pub fn send_to_user(&self, user_id: Uuid, message: WsMessage) {
        let targets = members(&self.users, user_id);
        self.deliver(&targets, &message);
    }

    pub fn send_to_room(&self, conversation_id: Uuid, message: WsMessage) {
        let targets = members(&self.rooms, conversation_id);
        self.deliver(&targets, &message);
    }

    pub fn broadcast(&self, message: WsMessage) {
        for session in self.sessions.iter() {
            let _ = session.sender.send(message.clone());
        }
    }

    /// Broadcast to every session but `excluded`.
    pub fn broadcast_except(&self, excluded: SessionId, message: WsMessage) {
        for session in self.sessions.iter().filter(|s| *s.key() != excluded) {
            let _ = session.sender.send(message.clone());
        }
    }

    /// Users with at least one session on this instance.
    pub fn connected_users(&self) -> Vec<Uuid> {
        self.users.iter().map(|entry| *entry.key()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.users.contains_key(&user_id)
    }

    fn deliver(&self, targets: &[SessionId], message: &WsMessage) {
        for session_id in targets {
            if let Some(session) = self.sessions.get(session_id) {
                let _ = session.sender.send(message.clone());
            }
        }
    }
}

fn members(index: &DashMap<Uuid, HashSet<SessionId>>, key: Uuid) -> Vec<SessionId> {
    index
        .get(&key)
        .map(|set| set.iter().copied().collect())
        .unwrap_or_default()
}

fn remove_member(index: &DashMap<Uuid, HashSet<SessionId>>, key: Uuid, session_id: SessionId) {
    if let Some(mut set) = index.get_mut(&key) {
        set.remove(&session_id);
    }
    index.remove_if(&key, |_, set| set.is_empty());
}
