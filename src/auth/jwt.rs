use crate::error::{AppError, Result};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "id")]
    pub sub: String, // user_id
    #[serde(default)]
    pub email: String,
    pub exp: i64,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Unauthorized("Invalid token".to_string()))
    }
}

/// Tokens are issued by the auth service; this side only verifies them.
pub fn verify_jwt(token: &str, secret: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::Unauthorized("Token has expired".to_string())
        }
        _ => AppError::Unauthorized("Invalid token".to_string()),
    })
}

#[cfg(test)]
pub fn create_jwt(user_id: Uuid, email: &str, secret: &str, expiration_hours: i64) -> String {
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        exp: (Utc::now() + Duration::hours(expiration_hours)).timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to encode test token")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_verify_roundtrip_resolves_user_id() {
        let user_id = Uuid::new_v4();
        let token = create_jwt(user_id, "a@example.com", SECRET, 1);

        let claims = verify_jwt(&token, SECRET).unwrap();
        assert_eq!(claims.user_id().unwrap(), user_id);
        assert_eq!(claims.email, "a@example.com");
    }

    #[test]
    fn test_wrong_secret_is_unauthorized() {
        let token = create_jwt(Uuid::new_v4(), "a@example.com", SECRET, 1);
        assert!(matches!(
            verify_jwt(&token, "other-secret"),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = create_jwt(Uuid::new_v4(), "a@example.com", SECRET, -2);
        match verify_jwt(&token, SECRET) {
            Err(AppError::Unauthorized(msg)) => assert_eq!(msg, "Token has expired"),
            other => panic!("expected expiry rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(verify_jwt("not-a-token", SECRET).is_err());
    }
}
