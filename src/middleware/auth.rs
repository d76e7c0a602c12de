use crate::{auth::verify_jwt, error::AppError, state::AppState, user::UserProfile};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
};

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = if let Some(auth_header) = req.headers().get("Authorization").and_then(|h| h.to_str().ok()) {
        auth_header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))?
            .to_string()
    } else {
        // Browsers cannot set headers on the WebSocket handshake, so the
        // realtime route passes the token as a query parameter instead.
        token_from_query(req.uri().query().unwrap_or(""))
            .ok_or(AppError::Unauthorized("Not authorized, no token provided".to_string()))?
    };

    let claims = verify_jwt(&token, &state.config.jwt_secret)?;
    let user_id = claims.user_id()?;

    let user = state
        .user_repository
        .find_by_id(user_id)
        .await?
        .ok_or(AppError::Unauthorized("User not found".to_string()))?;

    if !user.is_active {
        return Err(AppError::Forbidden("Account is deactivated".to_string()));
    }

    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// The authenticated caller, inserted by `auth_middleware`.
pub struct AuthUser(pub UserProfile);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<UserProfile>()
            .cloned()
            .map(AuthUser)
            .ok_or(AppError::Unauthorized("Invalid credentials".to_string()))
    }
}
