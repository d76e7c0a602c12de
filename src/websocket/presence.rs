use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use redis::{aio::MultiplexedConnection, Script};
use std::{collections::HashSet, time::Duration};
use uuid::Uuid;

use super::connection::SessionId;
use crate::error::Result;

/// Tracks which users currently hold at least one live session.
///
/// A user is online while the session set is non-empty, so only the first
/// connect and the last disconnect change the observable state.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Returns true when this is the user's first session.
    async fn register(&self, user_id: Uuid, session_id: SessionId) -> Result<bool>;
    /// Returns true when the user has no sessions left.
    async fn unregister(&self, user_id: Uuid, session_id: SessionId) -> Result<bool>;
    /// Keeps a registered session alive. Unknown sessions are ignored.
    async fn refresh(&self, user_id: Uuid, session_id: SessionId) -> Result<()>;
    async fn online_users(&self) -> Result<Vec<Uuid>>;
    async fn is_online(&self, user_id: Uuid) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryPresence {
    sessions: DashMap<Uuid, HashSet<SessionId>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresence {
    async fn register(&self, user_id: Uuid, session_id: SessionId) -> Result<bool> {
        let mut sessions = self.sessions.entry(user_id).or_default();
        let first = sessions.is_empty();
        sessions.insert(session_id);
        Ok(first)
    }

    async fn unregister(&self, user_id: Uuid, session_id: SessionId) -> Result<bool> {
        match self.sessions.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let had = entry.get_mut().remove(&session_id);
                if entry.get().is_empty() {
                    entry.remove();
                    Ok(had)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    // Sessions of this process end with the process.
    async fn refresh(&self, _user_id: Uuid, _session_id: SessionId) -> Result<()> {
        Ok(())
    }

    async fn online_users(&self) -> Result<Vec<Uuid>> {
        Ok(self.sessions.iter().map(|entry| *entry.key()).collect())
    }

    async fn is_online(&self, user_id: Uuid) -> Result<bool> {
        Ok(self.sessions.contains_key(&user_id))
    }
}

const ONLINE_KEY: &str = "presence:online";

fn sessions_key(user_id: Uuid) -> String {
    format!("presence:user:{}", user_id)
}

// KEYS[1] user sessions, KEYS[2] online users
// ARGV[1] session, ARGV[2] ttl seconds, ARGV[3] user
const REGISTER_LUA: &str = r"
local now = tonumber(redis.call('TIME')[1])
local expires = now + tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
local before = redis.call('ZCARD', KEYS[1])
redis.call('ZADD', KEYS[1], expires, ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], expires, ARGV[3])
if before == 0 then return 1 end
return 0
";

// KEYS[1] user sessions, KEYS[2] online users
// ARGV[1] session, ARGV[2] user
const UNREGISTER_LUA: &str = r"
local now = tonumber(redis.call('TIME')[1])
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
if redis.call('ZCARD', KEYS[1]) > 0 then return 0 end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[2])
return removed
";

// KEYS[1] user sessions, KEYS[2] online users
// ARGV[1] session, ARGV[2] ttl seconds, ARGV[3] user
const REFRESH_LUA: &str = r"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then return 0 end
local expires = tonumber(redis.call('TIME')[1]) + tonumber(ARGV[2])
redis.call('ZADD', KEYS[1], expires, ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], expires, ARGV[3])
return 1
";

// KEYS[1] online users
const ONLINE_USERS_LUA: &str = r"
local now = tonumber(redis.call('TIME')[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now)
return redis.call('ZRANGE', KEYS[1], 0, -1)
";

// KEYS[1] online users, ARGV[1] user
const IS_ONLINE_LUA: &str = r"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if score and tonumber(score) > tonumber(redis.call('TIME')[1]) then return 1 end
return 0
";

/// Presence shared through Redis so every instance sees the same online set.
///
/// Each user has a sorted set of session ids scored by lease expiry, and
/// `presence:online` scores users the same way. Every change runs as one
/// script, so the two sets never disagree. Leases are renewed by the
/// heartbeat; sessions of a crashed instance lapse after `ttl`.
pub struct RedisPresence {
    conn: MultiplexedConnection,
    ttl_secs: u64,
    register: Script,
    unregister: Script,
    refresh: Script,
    online_users: Script,
    is_online: Script,
}

impl RedisPresence {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let ttl_secs = ttl.as_secs().max(1);
        tracing::info!(ttl_secs, "Presence backed by Redis");

        Ok(Self {
            conn,
            ttl_secs,
            register: Script::new(REGISTER_LUA),
            unregister: Script::new(UNREGISTER_LUA),
            refresh: Script::new(REFRESH_LUA),
            online_users: Script::new(ONLINE_USERS_LUA),
            is_online: Script::new(IS_ONLINE_LUA),
        })
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn register(&self, user_id: Uuid, session_id: SessionId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let first: i64 = self
            .register
            .key(sessions_key(user_id))
            .key(ONLINE_KEY)
            .arg(session_id.to_string())
            .arg(self.ttl_secs)
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(first == 1)
    }

    async fn unregister(&self, user_id: Uuid, session_id: SessionId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let offline: i64 = self
            .unregister
            .key(sessions_key(user_id))
            .key(ONLINE_KEY)
            .arg(session_id.to_string())
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(offline == 1)
    }

    async fn refresh(&self, user_id: Uuid, session_id: SessionId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .refresh
            .key(sessions_key(user_id))
            .key(ONLINE_KEY)
            .arg(session_id.to_string())
            .arg(self.ttl_secs)
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn online_users(&self) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = self
            .online_users
            .key(ONLINE_KEY)
            .invoke_async(&mut conn)
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| Uuid::parse_str(m).ok())
            .collect())
    }

    async fn is_online(&self, user_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let online: i64 = self
            .is_online
            .key(ONLINE_KEY)
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(online == 1)
    }
}
