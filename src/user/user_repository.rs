use crate::error::{AppError, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::{collections::HashMap, path::Path};
use uuid::Uuid;

use super::user_models::UserProfile;

/// Resolves user ids to profiles. Users are owned by the user service; the
/// messaging core only reads them.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>>;
}

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityLookup for UserRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        let user = sqlx::query_as::<_, UserProfile>(
            "SELECT id, email, full_name, avatar_url, is_active FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }
}

/// Process-local directory used when no database is configured.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: HashMap<Uuid, UserProfile>,
}

impl InMemoryUserDirectory {
    pub fn new(users: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.id, u)).collect(),
        }
    }

    /// Loads a JSON array of profiles.
    pub async fn from_seed_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            tracing::error!("Failed to read seed users file {}: {}", path.display(), e);
            AppError::InternalError
        })?;
        let users: Vec<UserProfile> = serde_json::from_str(&raw).map_err(|e| {
            tracing::error!("Invalid seed users file {}: {}", path.display(), e);
            AppError::InternalError
        })?;

        Ok(Self::new(users))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl IdentityLookup for InMemoryUserDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserProfile>> {
        Ok(self.users.get(&id).cloned())
    }
}
