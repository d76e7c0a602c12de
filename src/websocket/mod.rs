pub mod connection;
pub mod gateway;
pub mod handler;
mod locks;
pub mod presence;
pub mod types;

pub use gateway::Gateway;
pub use handler::ws_handler;
pub use presence::{InMemoryPresence, PresenceStore, RedisPresence};
