use anyhow::{Context, Result};
use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use crate::{
    message::{MessageService, MessageStore},
    user::IdentityLookup,
    websocket::{Gateway, PresenceStore},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub user_repository: Arc<dyn IdentityLookup>,
    pub message_service: MessageService,
    pub gateway: Gateway,
}

impl AppState {
    /// Wires the REST service and the realtime gateway over the same stores.
    pub fn new(
        config: Config,
        message_store: Arc<dyn MessageStore>,
        user_repository: Arc<dyn IdentityLookup>,
        presence: Arc<dyn PresenceStore>,
    ) -> Self {
        let message_service = MessageService::new(message_store, user_repository.clone());
        let gateway = Gateway::new(message_service.clone(), presence);

        Self {
            config: Arc::new(config),
            user_repository,
            message_service,
            gateway,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub seed_users_file: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub ws_heartbeat_secs: u64,
    pub default_page_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // blank values count as unset
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = get("JWT_SECRET").context("JWT_SECRET must be set")?;

        let default_page_size: u32 = parse_or(&get, "MESSAGES_DEFAULT_PAGE_SIZE", 50)?;
        if !(1..=crate::message::message_dto::MAX_PAGE_SIZE).contains(&default_page_size) {
            anyhow::bail!(
                "MESSAGES_DEFAULT_PAGE_SIZE must be between 1 and {}",
                crate::message::message_dto::MAX_PAGE_SIZE
            );
        }

        let cors_origins = get("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Self {
            jwt_secret,
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: get("REDIS_URL"),
            seed_users_file: get("SEED_USERS_FILE").map(PathBuf::from),
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&get, "PORT", 3000)?,
            cors_origins,
            ws_heartbeat_secs: parse_or(&get, "WS_HEARTBEAT_SECS", 30)?,
            default_page_size,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.ws_heartbeat_secs.max(1))
    }

    /// A session that misses three heartbeats is considered gone.
    pub fn presence_ttl(&self) -> Duration {
        self.heartbeat_period() * 3
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("JWT_SECRET", "secret")]).unwrap();

        assert_eq!(config.database_url, None);
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.redis_url, None);
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
        assert_eq!(config.cors_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.ws_heartbeat_secs, 30);
        assert_eq!(config.presence_ttl(), Duration::from_secs(90));
        assert_eq!(config.default_page_size, 50);
    }

    #[test]
    fn test_zero_heartbeat_is_clamped() {
        let config = config(&[("JWT_SECRET", "secret"), ("WS_HEARTBEAT_SECS", "0")]).unwrap();

        assert_eq!(config.heartbeat_period(), Duration::from_secs(1));
        assert_eq!(config.presence_ttl(), Duration::from_secs(3));
    }

    #[test]
    fn test_missing_secret_is_an_error() {
        assert!(config(&[]).is_err());
        assert!(config(&[("JWT_SECRET", "  ")]).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("JWT_SECRET", "secret"),
            ("DATABASE_URL", "postgres://localhost/hr"),
            ("REDIS_URL", "redis://127.0.0.1/"),
            ("PORT", "8080"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("MESSAGES_DEFAULT_PAGE_SIZE", "20"),
            ("SEED_USERS_FILE", "users.json"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/hr"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(config.default_page_size, 20);
        assert_eq!(config.seed_users_file, Some(PathBuf::from("users.json")));
    }

    #[test]
    fn test_bad_numbers_are_reported() {
        let err = config(&[("JWT_SECRET", "secret"), ("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        assert!(config(&[("JWT_SECRET", "secret"), ("MESSAGES_DEFAULT_PAGE_SIZE", "500")]).is_err());
    }
}
